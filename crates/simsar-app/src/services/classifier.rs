use std::sync::Arc;

use thiserror::Error;

use crate::pipeline::classify::Classification;
use crate::pipeline::prompt::build_classification_prompt;
use crate::services::model::{complete_json, CompleteJsonError, CompletionClient, ModelError};
use crate::text::normalize_text;

/// Labels free text with a record type, language and cleaned text by asking
/// the completion service.
#[derive(Clone)]
pub struct Classifier {
    client: Arc<dyn CompletionClient>,
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error("classification output was not valid JSON after one repair attempt")]
    Parse { raw: String },
}

impl Classifier {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }

    /// Classify normalized intake text. The model's `normalized_text` is
    /// re-passed through the deterministic normalizer before anyone trusts
    /// it, and confidence is clamped into [0, 100].
    pub async fn classify(&self, normalized_text: &str) -> Result<Classification, ClassifyError> {
        let prompt = build_classification_prompt(normalized_text);
        let mut classification: Classification =
            complete_json(&self.client, &prompt)
                .await
                .map_err(|err| match err {
                    CompleteJsonError::Model(model) => ClassifyError::Model(model),
                    CompleteJsonError::Parse { raw, .. } => ClassifyError::Parse { raw },
                })?;

        classification.confidence = i64::from(classification.clamped_confidence());
        let cleaned = normalize_text(&classification.normalized_text);
        classification.normalized_text = if cleaned.is_empty() {
            normalized_text.to_string()
        } else {
            cleaned
        };

        tracing::debug!(
            detected_type = classification.detected_type.slug(),
            confidence = classification.confidence,
            "classified intake text"
        );
        Ok(classification)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::record::DetectedType;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct OneShot {
        responses: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CompletionClient for OneShot {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, ModelError> {
            let mut responses = self.responses.lock().expect("mutex poisoned");
            if responses.is_empty() {
                return Err(ModelError::EmptyResponse);
            }
            Ok(responses.remove(0))
        }
    }

    fn classifier(responses: Vec<&str>) -> Classifier {
        Classifier::new(Arc::new(OneShot {
            responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
        }))
    }

    #[tokio::test]
    async fn clamps_confidence_and_renormalizes_text() {
        let classifier = classifier(vec![
            r#"{"detected_type":"sale","confidence":180,"language":"mixed","normalized_text":"flat   for sale ٥٥٠٠٠٠٠ le","signals":["price"]}"#,
        ]);
        let result = classifier.classify("flat for sale").await.expect("classifies");
        assert_eq!(result.detected_type, DetectedType::Sale);
        assert_eq!(result.confidence, 100);
        assert_eq!(result.normalized_text, "flat for sale 5500000 egp");
    }

    #[tokio::test]
    async fn empty_model_text_falls_back_to_input() {
        let classifier = classifier(vec![
            r#"{"detected_type":"buyer","confidence":70,"language":"en","normalized_text":""}"#,
        ]);
        let result = classifier.classify("looking for a flat").await.expect("classifies");
        assert_eq!(result.normalized_text, "looking for a flat");
    }

    #[tokio::test]
    async fn double_parse_failure_is_a_named_error() {
        let classifier = classifier(vec!["nope", "still nope"]);
        let error = classifier.classify("text").await.expect_err("must fail");
        match error {
            ClassifyError::Parse { raw } => assert_eq!(raw, "still nope"),
            other => panic!("expected parse failure, got {other:?}"),
        }
    }
}
