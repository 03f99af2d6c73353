//! Detect-and-extract flows over a tempdir store and a scripted completion
//! client.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use tempfile::TempDir;

use simsar_app::paths::AppPaths;
use simsar_app::pipeline::record::{DetectedType, RecordType};
use simsar_app::services::{
    detect_and_extract, force_extract, CompletionClient, FsMediaStore, Governors, IntakeSession,
    IntakeStore, ModelError, PipelineContext, PipelineError, SessionStatus,
};

/// Returns canned responses in order; records how many calls were made.
struct ScriptedModel {
    responses: Mutex<Vec<String>>,
    calls: Mutex<usize>,
}

impl ScriptedModel {
    fn new(responses: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
            calls: Mutex::new(0),
        })
    }

    fn call_count(&self) -> usize {
        *self.calls.lock().expect("mutex poisoned")
    }
}

#[async_trait]
impl CompletionClient for ScriptedModel {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, ModelError> {
        *self.calls.lock().expect("mutex poisoned") += 1;
        let mut responses = self.responses.lock().expect("mutex poisoned");
        if responses.is_empty() {
            return Err(ModelError::EmptyResponse);
        }
        Ok(responses.remove(0))
    }
}

fn test_context(
    model: Arc<ScriptedModel>,
    governors: Governors,
) -> (Arc<PipelineContext>, TempDir) {
    let dir = TempDir::new().expect("temp dir");
    let paths = AppPaths::new(dir.path()).expect("paths");
    let store = Arc::new(IntakeStore::open(&paths).expect("store opens"));
    let media = Arc::new(FsMediaStore::new(
        paths.media_root().expect("media root"),
        "http://localhost:8080/files",
    ));
    let ctx = PipelineContext {
        store,
        media,
        model,
        governors,
    };
    (Arc::new(ctx), dir)
}

fn seeded_session(ctx: &PipelineContext, raw_text: &str) -> IntakeSession {
    let session = IntakeSession::new(raw_text);
    ctx.store.put_session(&session).expect("put session");
    session
}

const SALE_CLASSIFICATION: &str = r#"{"detected_type":"sale","confidence":91,"language":"mixed","normalized_text":"studio for sale in Marina Bay 3500000 egp call +20 101-555-2222","signals":["للبيع","price"]}"#;

const SALE_EXTRACTION: &str = r#"{"code":"","property_type":"studio","price":"3,500,000","currency":"le","size_sqm":"","bedrooms":"studio","bathrooms":"1","location_area":"Marina Bay","compound":"","floor":"","furnished":"FULLY","finishing":"","payment_terms":"","contact_name":"","contact_phone":"+20 101-555-2222","notes":""}"#;

#[tokio::test]
async fn sale_text_flows_to_normalized_fields() {
    let model = ScriptedModel::new(vec![SALE_CLASSIFICATION, SALE_EXTRACTION]);
    let (ctx, _dir) = test_context(model.clone(), Governors::default());
    let session = seeded_session(&ctx, "ستوديو للبيع في مارينا باي ٣٥٠٠٠٠٠ جنيه");

    let report = detect_and_extract(&ctx, &session.id, "agent-1")
        .await
        .expect("extracts");

    assert_eq!(report.detected_type, DetectedType::Sale);
    assert_eq!(report.confidence, 91);
    assert_eq!(report.fields["bedrooms"], "0", "studio rule applies");
    assert_eq!(report.fields["currency"], "egp");
    assert_eq!(report.fields["contact_phone"], "201015552222");
    assert_eq!(report.fields["furnished"], "", "off-list enum discarded");
    assert_eq!(report.fields["location_area"], report.fields["compound"]);
    assert_eq!(report.status, SessionStatus::Draft, "criticals present");
    assert!(report.completeness > 0.0);
    assert_eq!(model.call_count(), 2, "classify + extract, no segmentation");

    let stored = ctx
        .store
        .require_session(&session.id)
        .expect("session reloads");
    assert_eq!(stored.fields["price"], "3500000");
    assert_eq!(stored.meta.confidence, Some(91));
    assert_eq!(stored.meta.language.as_deref(), Some("mixed"));
}

#[tokio::test]
async fn missing_criticals_park_session_in_needs_review() {
    let classification = r#"{"detected_type":"buyer","confidence":70,"language":"en","normalized_text":"looking for something nice","signals":[]}"#;
    let extraction = r#"{"code":"","intent":"buy","budget_min":"","budget_max":"","currency":"","preferred_areas":"","property_type":"","bedrooms_needed":"","move_timeline":"","contact_name":"","contact_phone":"","notes":""}"#;
    let model = ScriptedModel::new(vec![classification, extraction]);
    let (ctx, _dir) = test_context(model, Governors::default());
    let session = seeded_session(&ctx, "looking for something nice");

    let report = detect_and_extract(&ctx, &session.id, "agent-1")
        .await
        .expect("extracts");

    assert_eq!(report.status, SessionStatus::NeedsReview);
    assert!(report.missing_critical.contains(&"budget".to_string()));
    assert!(report
        .missing_critical
        .contains(&"preferred_areas".to_string()));
}

#[tokio::test]
async fn multi_listing_splits_exactly_once() {
    let raw = "1) شقة للبيع 3500000 جنيه في التجمع\n2) شقة للبيع 4200000 جنيه في المعادي";
    let classification = format!(
        r#"{{"detected_type":"sale","confidence":85,"language":"ar","normalized_text":"{}","signals":[]}}"#,
        raw.replace('\n', "\\n")
    );
    // Two classify calls (one per run); the heuristic split needs no model.
    let model = ScriptedModel::new(vec![&classification, &classification]);
    let (ctx, _dir) = test_context(model.clone(), Governors::default());
    let session = seeded_session(&ctx, raw);

    let report = detect_and_extract(&ctx, &session.id, "agent-1")
        .await
        .expect("splits");
    assert_eq!(report.child_sessions.len(), 2);
    assert!(report.fields.is_empty(), "parent is not extracted");
    assert_eq!(report.status, SessionStatus::NeedsReview);

    let children = ctx.store.children_of(&session.id).expect("children");
    assert_eq!(children.len(), 2);
    assert!(children
        .iter()
        .all(|child| child.parent_id.as_deref() == Some(session.id.as_str())));

    // Re-running detection must reuse the children, not duplicate them.
    let second = detect_and_extract(&ctx, &session.id, "agent-1")
        .await
        .expect("re-run");
    assert_eq!(second.child_sessions.len(), 2);
    assert_eq!(ctx.store.children_of(&session.id).expect("children").len(), 2);
    assert_eq!(model.call_count(), 2, "classification only, both runs");
}

#[tokio::test]
async fn forced_type_bypasses_classification() {
    let model = ScriptedModel::new(vec![SALE_EXTRACTION]);
    let (ctx, _dir) = test_context(model.clone(), Governors::default());
    let session = seeded_session(&ctx, "studio for sale in Marina Bay 3500000 egp");

    let report = force_extract(&ctx, &session.id, RecordType::Sale, "agent-1")
        .await
        .expect("extracts");

    assert_eq!(report.detected_type, DetectedType::Sale);
    assert_eq!(report.confidence, 100);
    assert_eq!(report.fields["bedrooms"], "0");
    assert_eq!(model.call_count(), 1, "extraction only");
}

#[tokio::test]
async fn unparseable_extraction_parks_session_with_raw_error() {
    let model = ScriptedModel::new(vec![SALE_CLASSIFICATION, "garbage", "worse garbage"]);
    let (ctx, _dir) = test_context(model.clone(), Governors::default());
    let session = seeded_session(&ctx, "studio for sale 3500000");

    let error = detect_and_extract(&ctx, &session.id, "agent-1")
        .await
        .expect_err("must fail");
    match error {
        PipelineError::ExtractionParse { raw } => assert_eq!(raw, "worse garbage"),
        other => panic!("expected extraction parse failure, got {other:?}"),
    }
    assert_eq!(model.call_count(), 3, "classify, extract, one repair");

    // The session stays visible and re-runnable with the raw error kept.
    let parked = ctx
        .store
        .require_session(&session.id)
        .expect("session reloads");
    assert_eq!(parked.status, SessionStatus::NeedsReview);
    assert_eq!(parked.meta.extraction_error.as_deref(), Some("worse garbage"));

    let queue = ctx
        .store
        .list_sessions_by_status(SessionStatus::NeedsReview, 10)
        .expect("queue");
    assert!(queue.iter().any(|entry| entry.id == session.id));
}

#[tokio::test]
async fn unknown_session_is_a_named_error() {
    let model = ScriptedModel::new(vec![]);
    let (ctx, _dir) = test_context(model, Governors::default());
    let error = detect_and_extract(&ctx, "no-such-session", "agent-1")
        .await
        .expect_err("must fail");
    assert!(matches!(error, PipelineError::SessionNotFound(_)));
}

#[tokio::test]
async fn exhausted_actor_budget_rejects_immediately() {
    let quota = Quota::with_period(Duration::from_secs(60))
        .expect("quota")
        .allow_burst(NonZeroU32::new(1).expect("burst"));
    let limiter = Arc::new(RateLimiter::keyed(quota));
    let model = ScriptedModel::new(vec![SALE_CLASSIFICATION, SALE_EXTRACTION]);
    let (ctx, _dir) = test_context(
        model.clone(),
        Governors {
            model: Some(limiter),
        },
    );
    let session = seeded_session(&ctx, "studio for sale in Marina Bay 3500000 egp");

    detect_and_extract(&ctx, &session.id, "greedy-actor")
        .await
        .expect("first call is within budget");

    let error = detect_and_extract(&ctx, &session.id, "greedy-actor")
        .await
        .expect_err("budget spent");
    match error {
        PipelineError::RateLimited { retry_after_ms } => assert!(retry_after_ms > 0),
        other => panic!("expected rate limit rejection, got {other:?}"),
    }
    assert_eq!(model.call_count(), 2, "no model call after rejection");
}
