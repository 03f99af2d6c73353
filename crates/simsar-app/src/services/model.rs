use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::pipeline::prompt::{build_repair_prompt, Prompt};

const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// External completion service: one system/user message pair in, free-form
/// text out. The text is expected to be a single JSON object but is never
/// trusted to be one.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, ModelError>;
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("missing GOOGLE_AI_API_KEY or GEMINI_API_KEY environment variable")]
    MissingApiKey,
    #[error("model request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("model response carried no candidate text")]
    EmptyResponse,
}

/// Gemini-backed completion client over the generateContent REST endpoint.
#[derive(Clone)]
pub struct GeminiCompletionClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl GeminiCompletionClient {
    pub fn from_env(model: impl Into<String>) -> Result<Self, ModelError> {
        let api_key = std::env::var("GOOGLE_AI_API_KEY")
            .or_else(|_| std::env::var("GEMINI_API_KEY"))
            .map_err(|_| ModelError::MissingApiKey)?;

        Ok(Self {
            http: reqwest::Client::new(),
            api_key,
            model: model.into(),
        })
    }
}

#[async_trait]
impl CompletionClient for GeminiCompletionClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String, ModelError> {
        let url = format!("{GEMINI_ENDPOINT}/{}:generateContent", self.model);
        let body = serde_json::json!({
            "system_instruction": { "parts": [{ "text": system }] },
            "contents": [{ "role": "user", "parts": [{ "text": user }] }],
        });

        let response: JsonValue = self
            .http
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let text = response["candidates"]
            .get(0)
            .and_then(|candidate| candidate["content"]["parts"].as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part["text"].as_str())
                    .collect::<String>()
            })
            .filter(|text| !text.trim().is_empty())
            .ok_or(ModelError::EmptyResponse)?;

        Ok(text)
    }
}

/// Failure of the call-parse-repair-parse sequence.
#[derive(Debug, Error)]
pub enum CompleteJsonError {
    #[error(transparent)]
    Model(#[from] ModelError),
    /// The output stayed malformed after the single repair attempt. Carries
    /// the raw text so it can be preserved in session metadata.
    #[error("model output was not valid JSON after one repair attempt: {source}")]
    Parse {
        raw: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Ask the model for a typed JSON payload. Malformed output is retried
/// exactly once through a repair call that asks the model to fix its own
/// output into strict JSON; a second failure surfaces as
/// [`CompleteJsonError::Parse`].
pub async fn complete_json<T: DeserializeOwned>(
    client: &Arc<dyn CompletionClient>,
    prompt: &Prompt,
) -> Result<T, CompleteJsonError> {
    let first = client
        .complete(&prompt.system_message, &prompt.user_message)
        .await?;

    match parse_json_payload::<T>(&first) {
        Ok(value) => Ok(value),
        Err(first_error) => {
            tracing::warn!(error = %first_error, "model output failed to parse; attempting repair");
            let repair = build_repair_prompt(&first);
            let second = client
                .complete(&repair.system_message, &repair.user_message)
                .await?;
            parse_json_payload::<T>(&second).map_err(|source| CompleteJsonError::Parse {
                raw: second,
                source,
            })
        }
    }
}

fn parse_json_payload<T: DeserializeOwned>(response: &str) -> Result<T, serde_json::Error> {
    serde_json::from_str(extract_json_object(response))
}

/// Slice the JSON object out of a model response, tolerating markdown code
/// fences and prose around the payload.
pub fn extract_json_object(response: &str) -> &str {
    let trimmed = response.trim();

    if let Some(stripped) = trimmed.strip_prefix("```json") {
        if let Some(end) = stripped.find("```") {
            return stripped[..end].trim();
        }
    }
    if let Some(stripped) = trimmed.strip_prefix("```") {
        if let Some(end) = stripped.find("```") {
            return stripped[..end].trim();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return trimmed[start..=end].trim();
        }
    }

    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Scripted client returning canned responses in order.
    pub(crate) struct ScriptedClient {
        responses: Mutex<Vec<String>>,
        pub calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedClient {
        pub(crate) fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(str::to_string).collect()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionClient for ScriptedClient {
        async fn complete(&self, system: &str, user: &str) -> Result<String, ModelError> {
            self.calls
                .lock()
                .expect("call log mutex poisoned")
                .push((system.to_string(), user.to_string()));
            let mut responses = self.responses.lock().expect("response mutex poisoned");
            if responses.is_empty() {
                return Err(ModelError::EmptyResponse);
            }
            Ok(responses.remove(0))
        }
    }

    #[derive(Debug, serde::Deserialize, PartialEq)]
    struct Payload {
        price: String,
    }

    fn prompt() -> Prompt {
        Prompt {
            system_message: "sys".to_string(),
            user_message: "user".to_string(),
        }
    }

    #[test]
    fn strips_fenced_and_surrounded_json() {
        assert_eq!(
            extract_json_object("```json\n{\"a\":1}\n```"),
            "{\"a\":1}"
        );
        assert_eq!(extract_json_object("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(
            extract_json_object("Sure, here you go: {\"a\":1} hope that helps"),
            "{\"a\":1}"
        );
    }

    #[tokio::test]
    async fn clean_output_parses_without_repair() {
        let client: Arc<dyn CompletionClient> =
            Arc::new(ScriptedClient::new(vec!["{\"price\":\"5500000\"}"]));
        let parsed: Payload = complete_json(&client, &prompt()).await.expect("parses");
        assert_eq!(parsed.price, "5500000");
    }

    #[tokio::test]
    async fn malformed_output_is_repaired_once() {
        let scripted = Arc::new(ScriptedClient::new(vec![
            "{\"price\": 5",
            "{\"price\":\"5\"}",
        ]));
        let client: Arc<dyn CompletionClient> = scripted.clone();
        let parsed: Payload = complete_json(&client, &prompt()).await.expect("repaired");
        assert_eq!(parsed.price, "5");

        let calls = scripted.calls.lock().expect("call log mutex poisoned");
        assert_eq!(calls.len(), 2, "exactly one repair call");
        assert!(calls[1].1.contains("{\"price\": 5"), "repair sees bad output");
    }

    #[tokio::test]
    async fn second_failure_surfaces_parse_error_with_raw() {
        let client: Arc<dyn CompletionClient> =
            Arc::new(ScriptedClient::new(vec!["not json", "still not json"]));
        let result: Result<Payload, _> = complete_json(&client, &prompt()).await;
        match result {
            Err(CompleteJsonError::Parse { raw, .. }) => {
                assert_eq!(raw, "still not json");
            }
            other => panic!("expected parse failure, got {other:?}"),
        }
    }
}
