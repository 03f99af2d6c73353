//! Wires the intake pipeline into the HTTP surface exposed by
//! `simsar-server`.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use simsar_server::{
    ConfirmRequest, ConfirmResponse, DynIntakeProvider, ExtractRequest, ExtractResponse,
    IntakeError, IntakeProvider, MediaSummary,
};

use crate::config::AppConfig;
use crate::error::AppError;
use crate::pipeline::record::RecordType;
use crate::services::{
    build_pipeline_context, confirm, detect_and_extract, force_extract, ConfirmCommand,
    ConfirmMode, ExtractionReport, MergeDecision, PipelineContext, PipelineError,
};

/// Pipeline-backed implementation of the server's provider contract.
pub struct AppIntakeProvider {
    ctx: Arc<PipelineContext>,
}

impl AppIntakeProvider {
    pub fn new(ctx: Arc<PipelineContext>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl IntakeProvider for AppIntakeProvider {
    async fn extract(
        &self,
        session_id: &str,
        request: ExtractRequest,
        actor: &str,
    ) -> Result<ExtractResponse, IntakeError> {
        let report = match request.forced_type.as_deref() {
            None => detect_and_extract(&self.ctx, session_id, actor).await,
            Some(raw) => {
                let record_type = RecordType::from_str(raw).map_err(|_| {
                    IntakeError::invalid_param(
                        "forced_type",
                        format!("unknown record type `{raw}`"),
                    )
                })?;
                force_extract(&self.ctx, session_id, record_type, actor).await
            }
        }
        .map_err(map_pipeline_error)?;

        Ok(extract_response(report))
    }

    async fn confirm(
        &self,
        session_id: &str,
        request: ConfirmRequest,
        _actor: &str,
    ) -> Result<ConfirmResponse, IntakeError> {
        let command = confirm_command(session_id, request)?;
        let outcome = confirm(&self.ctx, command)
            .await
            .map_err(map_pipeline_error)?;

        Ok(ConfirmResponse {
            record_type: outcome.record_type.slug().to_string(),
            record_id: outcome.record_id,
            code: outcome.code,
            status: outcome.status.as_str().to_string(),
            changed_fields: outcome.changed_fields,
            media: MediaSummary {
                images: outcome.media.images,
                videos: outcome.media.videos,
                documents: outcome.media.documents,
                moved: outcome.media.moved,
                warnings: outcome.media.warnings,
            },
            steps: outcome
                .steps
                .into_iter()
                .map(|step| step.as_str().to_string())
                .collect(),
        })
    }
}

fn extract_response(report: ExtractionReport) -> ExtractResponse {
    ExtractResponse {
        session_id: report.session_id,
        detected_type: report.detected_type.slug().to_string(),
        confidence: report.confidence,
        language: report.language.as_ref().to_string(),
        status: report.status.as_str().to_string(),
        completeness: report.completeness,
        fields: report.fields,
        missing_critical: report.missing_critical,
        field_confidence: report.field_confidence,
        child_sessions: report.child_sessions,
    }
}

fn confirm_command(
    session_id: &str,
    request: ConfirmRequest,
) -> Result<ConfirmCommand, IntakeError> {
    let mode = match request.mode {
        simsar_server::ConfirmMode::CreateNew => ConfirmMode::CreateNew,
        simsar_server::ConfirmMode::UpdateExisting => ConfirmMode::UpdateExisting,
    };
    let merge_decisions: BTreeMap<String, MergeDecision> = request
        .merge_decisions
        .into_iter()
        .map(|(field, decision)| {
            let decision = match decision {
                simsar_server::MergeDecision::KeepExisting => MergeDecision::KeepExisting,
                simsar_server::MergeDecision::ReplaceWithNew => MergeDecision::ReplaceWithNew,
                simsar_server::MergeDecision::Append => MergeDecision::Append,
            };
            (field, decision)
        })
        .collect();

    Ok(ConfirmCommand {
        session_id: session_id.to_string(),
        mode,
        target_record_id: request.target_record_id,
        record_type: None,
        fields: request.fields,
        merge_decisions,
    })
}

fn map_pipeline_error(error: PipelineError) -> IntakeError {
    match error {
        PipelineError::SessionNotFound(id) => {
            IntakeError::not_found("session", format!("session `{id}` not found"))
        }
        PipelineError::RecordNotFound {
            record_type,
            record_id,
        } => IntakeError::not_found(
            "record",
            format!("{record_type} record `{record_id}` not found"),
        ),
        PipelineError::AlreadyConfirmed(id) => {
            IntakeError::conflict("session", format!("session `{id}` is already confirmed"))
        }
        PipelineError::InvalidRequest(message) => IntakeError::invalid_param("request", message),
        PipelineError::ClassificationParse { .. } | PipelineError::ExtractionParse { .. } => {
            IntakeError::unprocessable("model output stayed malformed after one repair attempt")
        }
        PipelineError::RateLimited { retry_after_ms } => IntakeError::rate_limited(
            "model call budget exceeded for this actor",
            Some(retry_after_ms),
        ),
        other => IntakeError::internal(other.to_string()),
    }
}

/// Build the production context and serve the HTTP API until shutdown.
pub async fn serve(config: AppConfig) -> Result<(), AppError> {
    let ctx = Arc::new(build_pipeline_context(&config)?);
    let provider: DynIntakeProvider = Arc::new(AppIntakeProvider::new(ctx));
    simsar_server::serve(config.server, provider).await?;
    Ok(())
}
