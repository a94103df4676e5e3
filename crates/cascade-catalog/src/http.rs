//! `ApiCall` - HTTP execution with timeout, cancellation and error
//! classification.

use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use cascade_core::EngineError;

use crate::args::{ApiCallArgs, HttpMethod};

/// Thin wrapper over a shared `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct HttpExecutor {
    client: reqwest::Client,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Perform the request described by `args`. `headers` carries the
    /// already-resolved header strings (credential injection happens before
    /// this layer) and `body` the resolved body, if any.
    ///
    /// The result is `{statusCode, headers, body}`; `body` is parsed JSON
    /// when the response says it is JSON, the raw text otherwise.
    #[instrument(skip_all, fields(method = %args.method, host = %url_host(&args.url).unwrap_or_default()))]
    pub async fn execute(
        &self,
        args: &ApiCallArgs,
        headers: &BTreeMap<String, String>,
        body: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<Value, EngineError> {
        let method = match args.method {
            HttpMethod::GET => reqwest::Method::GET,
            HttpMethod::POST => reqwest::Method::POST,
            HttpMethod::PUT => reqwest::Method::PUT,
            HttpMethod::DELETE => reqwest::Method::DELETE,
            HttpMethod::PATCH => reqwest::Method::PATCH,
        };

        let mut request = self.client.request(method, &args.url);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let budget = Duration::from_millis(args.timeout_ms);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            sent = tokio::time::timeout(budget, request.send()) => match sent {
                Err(_) => {
                    return Err(EngineError::Timeout {
                        timeout_ms: args.timeout_ms,
                    })
                }
                Ok(Err(e)) => return Err(classify(e, args.timeout_ms)),
                Ok(Ok(response)) => response,
            },
        };

        let status = response.status();
        let retry_after_ms = retry_after_ms(&response);
        let response_headers = header_map(&response);
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let text = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            read = tokio::time::timeout(budget, response.text()) => match read {
                Err(_) => {
                    return Err(EngineError::Timeout {
                        timeout_ms: args.timeout_ms,
                    })
                }
                Ok(Err(e)) => return Err(classify(e, args.timeout_ms)),
                Ok(Ok(text)) => text,
            },
        };

        if !status.is_success() {
            debug!(status = status.as_u16(), "API call failed");
            return Err(EngineError::Api {
                status: status.as_u16(),
                retry_after_ms,
            });
        }

        let body = if content_type.contains("json") {
            // A JSON content type with an unparseable body degrades to text.
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        } else {
            Value::String(text)
        };

        Ok(json!({
            "statusCode": status.as_u16(),
            "headers": Value::Object(response_headers),
            "body": body,
        }))
    }
}

fn classify(error: reqwest::Error, timeout_ms: u64) -> EngineError {
    if error.is_timeout() {
        return EngineError::Timeout { timeout_ms };
    }
    // Error text without the URL, so credentials embedded in it never leak.
    let message = error.without_url().to_string();
    EngineError::Network(message)
}

fn retry_after_ms(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|seconds| seconds * 1000)
}

fn header_map(response: &reqwest::Response) -> Map<String, Value> {
    let mut out = Map::new();
    for (name, value) in response.headers() {
        if let Ok(value) = value.to_str() {
            out.insert(name.as_str().to_string(), Value::String(value.to_string()));
        }
    }
    out
}

/// Host portion of a URL, when it parses.
pub fn url_host(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

/// Path portion of a URL, when it parses.
pub fn url_path(url: &str) -> Option<String> {
    reqwest::Url::parse(url).ok().map(|u| u.path().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_host() {
        assert_eq!(
            url_host("https://api.example.com/users?page=2"),
            Some("api.example.com".to_string())
        );
        assert_eq!(
            url_host("http://localhost:9999/x"),
            Some("localhost".to_string())
        );
        assert_eq!(url_host("not a url"), None);
    }
}
