use std::collections::BTreeMap;

use serde::Serialize;

use crate::pipeline::classify::Language;
use crate::pipeline::record::{DetectedType, RecordType};
use crate::pipeline::validate::{completeness_score, validate_and_normalize};
use crate::services::classifier::{Classifier, ClassifyError};
use crate::services::context::{PipelineContext, PipelineError, PipelineResult};
use crate::services::extractor::{ExtractError, Extractor};
use crate::services::segmenter::Segmenter;
use crate::services::store::{
    IntakeSession, SessionStatus, TimelineEvent, TimelineEventKind,
};
use crate::text::normalize_text;

/// Outcome of the detect-and-extract operation over one session.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractionReport {
    pub session_id: String,
    pub detected_type: DetectedType,
    pub confidence: u8,
    pub language: Language,
    pub status: SessionStatus,
    pub completeness: f32,
    pub fields: BTreeMap<String, String>,
    pub missing_critical: Vec<String>,
    pub field_confidence: BTreeMap<String, f32>,
    /// Non-empty when the session was split instead of extracted.
    pub child_sessions: Vec<String>,
}

/// Classify, optionally split, extract and normalize one intake session,
/// persisting the result. The session always survives in a re-runnable
/// state: parse failures park it in needs_review with the raw error kept
/// in metadata.
pub async fn detect_and_extract(
    ctx: &PipelineContext,
    session_id: &str,
    actor: &str,
) -> PipelineResult<ExtractionReport> {
    ctx.check_model_budget(actor)?;
    let mut session = ctx.store.require_session(session_id)?;

    let normalized = normalize_text(&session.raw_text);
    let classifier = Classifier::new(ctx.model.clone());
    let classification = match classifier.classify(&normalized).await {
        Ok(classification) => classification,
        Err(ClassifyError::Parse { raw }) => {
            park_unparseable(ctx, &mut session, &raw)?;
            return Err(PipelineError::ClassificationParse { raw });
        }
        Err(ClassifyError::Model(err)) => return Err(err.into()),
    };

    let detected = classification.detected_type;
    session.detected_type = Some(detected);
    session.meta.language = Some(classification.language.as_ref().to_string());
    session.meta.confidence = Some(classification.clamped_confidence());
    session.meta.signals = classification.signals.clone();

    // Only a parentless session may split; children extract directly.
    if session.parent_id.is_none() {
        let segmenter = Segmenter::new(ctx.model.clone());
        let split = segmenter.detect(&classification.normalized_text).await?;
        if split.multi_listing {
            let children = split_into_children(ctx, &mut session, &split.segments)?;
            let report = split_report(&session, detected, &classification.language, children);
            return Ok(report);
        }
    }

    extract_into_session(
        ctx,
        &mut session,
        detected,
        &classification.normalized_text,
        classification.language,
        classification.clamped_confidence(),
    )
    .await
}

/// Extraction with an explicit type, bypassing classification (and
/// splitting). Used when a reviewer overrides a bad detection.
pub async fn force_extract(
    ctx: &PipelineContext,
    session_id: &str,
    record_type: RecordType,
    actor: &str,
) -> PipelineResult<ExtractionReport> {
    ctx.check_model_budget(actor)?;
    let mut session = ctx.store.require_session(session_id)?;

    let normalized = normalize_text(&session.raw_text);
    let detected = DetectedType::from(record_type);
    session.detected_type = Some(detected);
    let language = session
        .meta
        .language
        .as_deref()
        .and_then(parse_language)
        .unwrap_or(Language::Mixed);

    extract_into_session(ctx, &mut session, detected, &normalized, language, 100).await
}

async fn extract_into_session(
    ctx: &PipelineContext,
    session: &mut IntakeSession,
    detected: DetectedType,
    normalized_text: &str,
    language: Language,
    confidence: u8,
) -> PipelineResult<ExtractionReport> {
    let extractor = Extractor::new(ctx.model.clone());
    let extracted = match extractor.extract(detected, normalized_text).await {
        Ok(extracted) => extracted,
        Err(ExtractError::Parse { raw }) => {
            park_unparseable(ctx, session, &raw)?;
            return Err(PipelineError::ExtractionParse { raw });
        }
        Err(ExtractError::Model(err)) => return Err(err.into()),
    };

    let outcome =
        validate_and_normalize(detected, &extracted, normalized_text, &BTreeMap::new());

    session.fields = outcome.fields.clone();
    session.meta.language = Some(language.as_ref().to_string());
    session.meta.confidence = Some(confidence);
    session.meta.missing_critical = outcome.missing_critical.clone();
    session.meta.field_confidence = outcome.confidence.clone();
    session.meta.extraction_error = None;
    session.completeness = detected
        .record_type()
        .map(|record_type| completeness_score(record_type, &outcome.fields))
        .unwrap_or(0.0);
    session.status = if outcome.missing_critical.is_empty() {
        SessionStatus::Draft
    } else {
        SessionStatus::NeedsReview
    };
    session.touch();
    ctx.store.put_session(session)?;

    tracing::info!(
        session_id = %session.id,
        detected_type = detected.slug(),
        status = session.status.as_str(),
        missing = outcome.missing_critical.len(),
        "session extracted"
    );

    Ok(ExtractionReport {
        session_id: session.id.clone(),
        detected_type: detected,
        confidence,
        language,
        status: session.status,
        completeness: session.completeness,
        fields: outcome.fields,
        missing_critical: outcome.missing_critical,
        field_confidence: outcome.confidence,
        child_sessions: Vec::new(),
    })
}

/// Create child sessions for a multi-listing parent, exactly once:
/// existing children short-circuit so re-running detection never
/// duplicates them.
fn split_into_children(
    ctx: &PipelineContext,
    parent: &mut IntakeSession,
    segments: &[String],
) -> PipelineResult<Vec<String>> {
    let existing = ctx.store.children_of(&parent.id)?;
    if !existing.is_empty() {
        tracing::debug!(
            session_id = %parent.id,
            children = existing.len(),
            "session already split; reusing children"
        );
        return Ok(existing.into_iter().map(|child| child.id).collect());
    }

    let mut children = Vec::new();
    for segment in segments {
        let child = IntakeSession::child_of(&parent.id, segment.clone());
        ctx.store.put_session(&child)?;
        children.push(child.id);
    }

    parent.status = SessionStatus::NeedsReview;
    parent.meta.split_children = children.clone();
    parent.touch();
    ctx.store.put_session(parent)?;
    ctx.store.append_event(TimelineEvent::for_session(
        &parent.id,
        TimelineEventKind::SessionSplit {
            children: children.clone(),
        },
    ))?;

    tracing::info!(
        session_id = %parent.id,
        children = children.len(),
        "session split into child listings"
    );
    Ok(children)
}

fn split_report(
    session: &IntakeSession,
    detected: DetectedType,
    language: &Language,
    children: Vec<String>,
) -> ExtractionReport {
    ExtractionReport {
        session_id: session.id.clone(),
        detected_type: detected,
        confidence: session.meta.confidence.unwrap_or(0),
        language: *language,
        status: session.status,
        completeness: session.completeness,
        fields: BTreeMap::new(),
        missing_critical: Vec::new(),
        field_confidence: BTreeMap::new(),
        child_sessions: children,
    }
}

/// Park a session in needs_review with the raw model output preserved, so
/// it stays visible and re-runnable instead of being dropped.
fn park_unparseable(
    ctx: &PipelineContext,
    session: &mut IntakeSession,
    raw: &str,
) -> PipelineResult<()> {
    session.status = SessionStatus::NeedsReview;
    session.meta.extraction_error = Some(raw.to_string());
    session.touch();
    ctx.store.put_session(session)?;
    Ok(())
}

fn parse_language(value: &str) -> Option<Language> {
    match value {
        "ar" => Some(Language::Ar),
        "en" => Some(Language::En),
        "mixed" => Some(Language::Mixed),
        _ => None,
    }
}
