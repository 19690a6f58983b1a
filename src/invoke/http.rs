//! reqwest adapter: executes a prepared request and maps the outcome into
//! a classified [`ApiError`] suitable for the invoker.

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::invoke::ApiError;

/// How much of an error body to keep in the error message.
const BODY_SNIPPET_LEN: usize = 512;

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        // Statusless reqwest errors are transport-level: timeouts, DNS,
        // connection resets, interrupted bodies. All retryable.
        ApiError::Transport {
            message: err.to_string(),
        }
    }
}

/// Extract the machine-readable reason from a Google-style error body:
/// `{"error": {"errors": [{"reason": "rateLimitExceeded"}]}}`, falling
/// back to `{"error": {"status": "..."}}`.
fn extract_reason(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;

    if let Some(reason) = error
        .get("errors")
        .and_then(|e| e.get(0))
        .and_then(|e| e.get("reason"))
        .and_then(Value::as_str)
    {
        return Some(reason.to_string());
    }

    error
        .get("status")
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= BODY_SNIPPET_LEN {
        trimmed.to_string()
    } else {
        let mut end = BODY_SNIPPET_LEN;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &trimmed[..end])
    }
}

/// Send a prepared request; non-2xx responses become classified
/// [`ApiError::Http`] values carrying the extracted reason.
pub async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Http {
        status: status.as_u16(),
        reason: extract_reason(&body),
        message: if body.trim().is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {}", snippet(&body))
        },
    })
}

/// Send a prepared request and decode a JSON response body.
pub async fn send_json<T: DeserializeOwned>(
    request: reqwest::RequestBuilder,
) -> Result<T, ApiError> {
    let response = send(request).await?;
    response.json::<T>().await.map_err(ApiError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_from_errors_array() {
        let body = r#"{"error": {"errors": [{"reason": "rateLimitExceeded"}]}}"#;
        assert_eq!(extract_reason(body).as_deref(), Some("rateLimitExceeded"));
    }

    #[test]
    fn reason_falls_back_to_status_field() {
        let body = r#"{"error": {"code": 429, "status": "RESOURCE_EXHAUSTED"}}"#;
        assert_eq!(extract_reason(body).as_deref(), Some("RESOURCE_EXHAUSTED"));
    }

    #[test]
    fn reason_absent_for_plain_bodies() {
        assert_eq!(extract_reason("not json"), None);
        assert_eq!(extract_reason(r#"{"message": "nope"}"#), None);
        assert_eq!(extract_reason(r#"{"error": "string error"}"#), None);
    }

    #[test]
    fn snippet_truncates_long_bodies() {
        let long = "x".repeat(2000);
        let s = snippet(&long);
        assert!(s.ends_with("..."));
        assert!(s.len() <= BODY_SNIPPET_LEN + 3);
        assert_eq!(snippet("  short  "), "short");
    }
}
