use std::sync::Arc;

use thiserror::Error;

use crate::pipeline::classify::Segmentation;
use crate::pipeline::prompt::build_segmentation_prompt;
use crate::services::model::{complete_json, CompleteJsonError, CompletionClient, ModelError};
use crate::text::{
    heuristic_split_listings, looks_ambiguous, normalize_text, SplitOutcome,
    MAX_LISTING_SEGMENTS,
};

/// Decides whether one blob of text describes multiple listings: cheap
/// heuristics first, a model segmentation only when the heuristics stay
/// inconclusive.
#[derive(Clone)]
pub struct Segmenter {
    client: Arc<dyn CompletionClient>,
}

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error(transparent)]
    Model(#[from] ModelError),
}

impl Segmenter {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }

    pub async fn detect(&self, normalized_text: &str) -> Result<SplitOutcome, SegmentError> {
        let heuristic = heuristic_split_listings(normalized_text);
        if heuristic.multi_listing {
            return Ok(heuristic);
        }
        if !looks_ambiguous(normalized_text) {
            return Ok(SplitOutcome::single());
        }

        // Heuristic was inconclusive; the model gets one shot. A parse
        // failure here is not fatal, the blob just stays a single listing.
        let prompt = build_segmentation_prompt(normalized_text);
        let segmentation: Segmentation = match complete_json(&self.client, &prompt).await {
            Ok(parsed) => parsed,
            Err(CompleteJsonError::Model(err)) => return Err(SegmentError::Model(err)),
            Err(CompleteJsonError::Parse { .. }) => {
                tracing::warn!("segmentation output unparseable; keeping single listing");
                return Ok(SplitOutcome::single());
            }
        };

        let mut segments: Vec<String> = segmentation
            .segments
            .iter()
            .map(|segment| normalize_text(segment))
            .filter(|segment| !segment.is_empty())
            .collect();
        segments.truncate(MAX_LISTING_SEGMENTS);

        if segments.len() > 1 {
            Ok(SplitOutcome {
                multi_listing: true,
                segments,
            })
        } else {
            Ok(SplitOutcome::single())
        }
    }
}
