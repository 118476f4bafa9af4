//! Wolfram Alpha queries.
//!
//! Sends the command's text to the Wolfram Alpha query API and replies
//! with the first plaintext result pod, a did-you-mean suggestion list
//! when nothing matched, and always a link to the full results page.

use crate::dispatch::CommandInvocation;
use crate::error::{HandlerError, HandlerLoadError, HandlerResult};
use crate::handlers::{BotContext, Handler};
use crate::store::StateStore;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

const DEFAULT_API_URL: &str = "https://api.wolframalpha.com/v2/query";
// Wolfram Alpha can be slow to answer.
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);
const PODS_TO_FETCH: usize = 3;

#[derive(Debug, Deserialize)]
struct QueryResponse {
    queryresult: QueryResult,
}

#[derive(Debug, Default, Deserialize)]
struct QueryResult {
    #[serde(default)]
    success: bool,
    /// `false` on a clean query, an object with details when the API
    /// rejected it.
    #[serde(default)]
    error: Value,
    #[serde(default)]
    pods: Vec<Pod>,
    /// Either one suggestion object or an array of them.
    #[serde(default)]
    didyoumeans: Value,
}

impl QueryResult {
    fn is_error(&self) -> bool {
        self.error.as_bool() == Some(true) || self.error.is_object()
    }
}

#[derive(Debug, Default, Deserialize)]
struct Pod {
    #[serde(default)]
    title: String,
    #[serde(default)]
    subpods: Vec<Subpod>,
}

#[derive(Debug, Default, Deserialize)]
struct Subpod {
    #[serde(default)]
    plaintext: Option<String>,
}

/// The first usable plaintext answer, skipping the input echo pod.
fn first_answer(pods: &[Pod]) -> Option<String> {
    for pod in pods.iter().skip(1) {
        if pod.title == "Input" {
            continue;
        }
        for subpod in &pod.subpods {
            let Some(text) = &subpod.plaintext else {
                continue;
            };
            let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if !cleaned.is_empty() {
                return Some(cleaned);
            }
        }
    }
    None
}

/// Did-you-mean suggestions worth repeating (everything not marked low
/// confidence).
fn suggestions(value: &Value) -> Vec<String> {
    let entries: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![value],
        _ => Vec::new(),
    };
    entries
        .into_iter()
        .filter(|entry| entry.get("level").and_then(Value::as_str) != Some("low"))
        .filter_map(|entry| entry.get("val").and_then(Value::as_str))
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .collect()
}

fn search_url(query: &str) -> String {
    reqwest::Url::parse_with_params("https://www.wolframalpha.com/input/", [("i", query)])
        .map(|url| url.to_string())
        .unwrap_or_else(|_| "https://www.wolframalpha.com/".to_string())
}

/// Answers questions through the Wolfram Alpha API.
pub struct WolframHandler {
    api_key: Option<String>,
    api_url: String,
    client: OnceLock<reqwest::Client>,
}

impl WolframHandler {
    pub fn new(api_key: Option<String>) -> Self {
        Self::with_api_url(api_key, DEFAULT_API_URL)
    }

    /// Same as [`WolframHandler::new`] but pointed at a different query
    /// endpoint. Used by tests.
    pub fn with_api_url(api_key: Option<String>, api_url: impl Into<String>) -> Self {
        Self {
            api_key,
            api_url: api_url.into(),
            client: OnceLock::new(),
        }
    }

    async fn query(&self, input: &str) -> Result<QueryResult, HandlerError> {
        let client = self
            .client
            .get()
            .ok_or_else(|| HandlerError::Failed("wolfram handler not initialized".to_string()))?;
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| HandlerError::Failed("no API key configured".to_string()))?;

        let pod_index = (1..=PODS_TO_FETCH)
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let response: QueryResponse = client
            .get(&self.api_url)
            .query(&[
                ("appid", key),
                ("input", input),
                ("podindex", &pod_index),
                ("output", "json"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.queryresult)
    }

    fn format_result(query: &str, result: &QueryResult) -> String {
        let mut reply = if result.is_error() {
            "Sorry, an error occurred while asking Wolfram Alpha.".to_string()
        } else if !result.success {
            let suggestions = suggestions(&result.didyoumeans);
            if suggestions.is_empty() {
                "No results found, sorry.".to_string()
            } else {
                format!(
                    "No results found, sorry. Did you perhaps mean: {}?",
                    suggestions.join(", ")
                )
            }
        } else {
            first_answer(&result.pods).unwrap_or_else(|| {
                "Sorry, the results were either images or non-existent.".to_string()
            })
        };
        reply.push_str(&format!(" ({})", search_url(query)));
        reply
    }
}

#[async_trait]
impl Handler for WolframHandler {
    fn name(&self) -> &'static str {
        "wolframalpha"
    }

    fn triggers(&self) -> &[&'static str] {
        &["wolfram", "wolframalpha", "wa"]
    }

    fn help_text(&self) -> &str {
        "Sends the provided query to Wolfram Alpha and shows the results, if any."
    }

    fn runs_off_thread(&self) -> bool {
        true
    }

    async fn on_load(&self, _store: &StateStore) -> Result<(), HandlerLoadError> {
        if self.api_key.is_none() {
            return Err(HandlerLoadError::MissingApiKey("wolframalpha"));
        }
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| HandlerLoadError::Other(format!("http client: {e}")))?;
        let _ = self.client.set(client);
        Ok(())
    }

    async fn execute(&self, ctx: &BotContext, invocation: &CommandInvocation) -> HandlerResult {
        if invocation.args.is_empty() {
            return ctx
                .reply(
                    invocation,
                    "No query provided. I'm not just going to make something up, \
                     I have an API call limit! Add your question after the command.",
                )
                .await;
        }
        let query = invocation.args.join(" ");
        let reply = match self.query(&query).await {
            Ok(result) => {
                if result.is_error() {
                    warn!(query = %query, "Wolfram Alpha returned a query error");
                }
                Self::format_result(&query, &result)
            }
            Err(e) => {
                warn!(query = %query, error = %e, "Wolfram Alpha request failed");
                "Sorry, Wolfram Alpha took too long to respond or is unreachable. \
                 Try again in a bit?"
                    .to_string()
            }
        };
        ctx.reply(invocation, &reply).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_answer_skips_the_input_pod() {
        let json = r#"{"queryresult":{"success":true,"error":false,"pods":[
            {"title":"Input","subpods":[{"plaintext":"1+1"}]},
            {"title":"Result","subpods":[{"plaintext":null},{"plaintext":"  2\n  "}]}
        ]}}"#;
        let parsed: QueryResponse = serde_json::from_str(json).expect("parse");
        let result = parsed.queryresult;
        assert!(!result.is_error());
        assert!(result.success);
        assert_eq!(first_answer(&result.pods).as_deref(), Some("2"));
    }

    #[test]
    fn image_only_pods_yield_no_answer() {
        let json = r#"{"queryresult":{"success":true,"error":false,"pods":[
            {"title":"Input","subpods":[{"plaintext":"a picture"}]},
            {"title":"Result","subpods":[{"plaintext":""}]}
        ]}}"#;
        let parsed: QueryResponse = serde_json::from_str(json).expect("parse");
        assert!(first_answer(&parsed.queryresult.pods).is_none());
        let reply = WolframHandler::format_result("a picture", &parsed.queryresult);
        assert!(reply.contains("images or non-existent"));
    }

    #[test]
    fn suggestions_handle_both_response_shapes() {
        let single: Value =
            serde_json::from_str(r#"{"level":"medium","val":"pi day"}"#).expect("parse");
        assert_eq!(suggestions(&single), vec!["pi day".to_string()]);

        let several: Value = serde_json::from_str(
            r#"[{"level":"high","val":"one"},{"level":"low","val":"skipped"},{"level":"medium","val":"two"}]"#,
        )
        .expect("parse");
        assert_eq!(suggestions(&several), vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn failed_query_mentions_suggestions() {
        let json = r#"{"queryresult":{"success":false,"error":false,
            "didyoumeans":{"level":"medium","val":"weather"}}}"#;
        let parsed: QueryResponse = serde_json::from_str(json).expect("parse");
        let reply = WolframHandler::format_result("wether", &parsed.queryresult);
        assert!(reply.contains("Did you perhaps mean: weather?"));
    }

    #[test]
    fn api_error_is_reported_generically() {
        let json = r#"{"queryresult":{"success":false,"error":{"code":"1","msg":"bad appid"}}}"#;
        let parsed: QueryResponse = serde_json::from_str(json).expect("parse");
        assert!(parsed.queryresult.is_error());
        let reply = WolframHandler::format_result("anything", &parsed.queryresult);
        assert!(reply.contains("an error occurred"));
    }

    #[test]
    fn replies_always_link_the_results_page() {
        let url = search_url("how far is the moon");
        assert!(url.starts_with("https://www.wolframalpha.com/input/?i="));
        assert!(!url.contains(' '));
    }
}
