use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::GraphQLRequest;
use crate::error::{ClientError, Result};

/// Sends a rendered query or mutation and returns its `data` payload.
#[async_trait]
pub trait RequestDispatcher: Send + Sync {
    async fn dispatch(&self, operation: &str) -> Result<Value>;
}

pub struct HttpRequestDispatcher {
    client: reqwest::Client,
    url: String,
}

impl HttpRequestDispatcher {
    pub fn new(url: impl Into<String>) -> Self {
        HttpRequestDispatcher {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(HttpRequestDispatcher {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RequestDispatcher for HttpRequestDispatcher {
    async fn dispatch(&self, operation: &str) -> Result<Value> {
        let request_body = GraphQLRequest {
            query: operation.to_string(),
        };
        debug!(url = %self.url, "dispatching operation");

        let response = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await
            .map_err(|e| {
                ClientError::RequestFailed(format!("failed to send request to {}: {}", self.url, e))
            })?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::RequestFailed(format!(
                "{} responded with {}: {}",
                self.url, status, body
            )));
        }

        let json_response = response.json::<Value>().await.map_err(|e| {
            ClientError::RequestFailed(format!("failed to parse response from {}: {}", self.url, e))
        })?;
        extract_data(json_response)
    }
}

/// Splits a GraphQL response into its data, failing when there is none.
pub(crate) fn extract_data(mut response: Value) -> Result<Value> {
    let messages = error_messages(&response);
    match response.get_mut("data").map(Value::take) {
        Some(data) if !data.is_null() => {
            if !messages.is_empty() {
                warn!(errors = ?messages, "response carried partial errors");
            }
            Ok(data)
        }
        _ if messages.is_empty() => Err(ClientError::RequestFailed(
            "response carried no data".to_string(),
        )),
        _ => Err(ClientError::RequestFailed(messages.join("; "))),
    }
}

fn error_messages(response: &Value) -> Vec<String> {
    response
        .get("errors")
        .and_then(Value::as_array)
        .map(|errors| {
            errors
                .iter()
                .map(|error| {
                    error
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| error.to_string())
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn data_is_unwrapped() {
        let data = extract_data(json!({ "data": { "user": { "id": "1" } } })).unwrap();
        assert_eq!(data, json!({ "user": { "id": "1" } }));
    }

    #[test]
    fn partial_errors_keep_the_data() {
        let data = extract_data(json!({
            "data": { "user": null },
            "errors": [{ "message": "not found" }]
        }))
        .unwrap();
        assert_eq!(data, json!({ "user": null }));
    }

    #[test]
    fn errors_without_data_fail() {
        let err = extract_data(json!({
            "data": null,
            "errors": [{ "message": "boom" }, { "message": "bang" }]
        }))
        .unwrap_err();
        assert_eq!(err, ClientError::RequestFailed("boom; bang".to_string()));
    }

    #[test]
    fn empty_body_fails() {
        assert!(matches!(
            extract_data(json!({})),
            Err(ClientError::RequestFailed(_))
        ));
    }
}
