//! Builtin VM operators.

use std::sync::OnceLock;
use std::time::Duration;

use tracing::debug;

use ailoy_types::{ComponentError, Value, ValueMap};

use crate::module::ModuleRegistry;

/// Default connect timeout for the `http_request` operator.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for the `http_request` operator.
const READ_TIMEOUT: Duration = Duration::from_secs(60);

fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()
            .unwrap_or_default()
    })
}

/// The registry of builtin operators: `http_request`, `echo`, `split_text`.
pub fn builtins() -> ModuleRegistry {
    let mut registry = ModuleRegistry::new();
    registry
        .register_operator("http_request", http_request)
        .expect("fresh registry");
    registry
        .register_operator("echo", |inputs| async move { Ok(inputs) })
        .expect("fresh registry");
    registry
        .register_operator("split_text", split_text)
        .expect("fresh registry");
    registry
}

/// Perform an HTTP request on behalf of a tool or component.
///
/// Inputs: `{url, method, headers, body?}`. Outputs:
/// `{status_code, headers, body}` with the body as raw bytes.
async fn http_request(inputs: Value) -> Result<Value, ComponentError> {
    let url = inputs
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| ComponentError::validation("http_request requires a url"))?;
    let method = inputs
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("GET");
    let method = reqwest::Method::from_bytes(method.as_bytes())
        .map_err(|_| ComponentError::validation(format!("invalid http method {method}")))?;

    let mut request = http_client().request(method, url);
    if let Some(headers) = inputs.get("headers").and_then(Value::as_map) {
        for (name, value) in headers {
            if let Some(value) = value.as_str() {
                request = request.header(name, value);
            }
        }
    }
    if let Some(body) = inputs.get("body").and_then(Value::as_str) {
        request = request.body(body.to_owned());
    }

    debug!(url, "http_request");
    let response = request
        .send()
        .await
        .map_err(|e| ComponentError::io(format!("request to {url} failed: {e}")))?;

    let status = response.status().as_u16();
    let mut headers = ValueMap::new();
    for (name, value) in response.headers() {
        if let Ok(text) = value.to_str() {
            headers.insert(name.to_string(), Value::from(text));
        }
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| ComponentError::io(format!("reading body from {url} failed: {e}")))?;

    Ok(Value::map([
        ("status_code", Value::UInt(status as u64)),
        ("headers", Value::Map(headers)),
        ("body", Value::Bytes(body.to_vec())),
    ]))
}

/// Split text into chunks for embedding.
///
/// Splits on blank lines first, then packs paragraphs greedily up to
/// `chunk_size` characters (default 4000). A single oversized paragraph
/// becomes its own chunk rather than being cut mid-sentence.
async fn split_text(inputs: Value) -> Result<Value, ComponentError> {
    let text = inputs
        .get("text")
        .and_then(Value::as_str)
        .ok_or_else(|| ComponentError::validation("split_text requires text"))?;
    let chunk_size = inputs
        .get("chunk_size")
        .and_then(Value::as_u64)
        .unwrap_or(4000) as usize;

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    for paragraph in text.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }
        if !current.is_empty() && current.len() + 2 + paragraph.len() > chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(paragraph);
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    Ok(Value::map([(
        "chunks",
        Value::Array(chunks.into_iter().map(Value::Str).collect()),
    )]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_returns_inputs() {
        let registry = builtins();
        let echo = registry.operator("echo").unwrap();
        let input = Value::map([("k", Value::Int(1))]);
        assert_eq!(echo(input.clone()).await.unwrap(), input);
    }

    #[tokio::test]
    async fn split_text_packs_paragraphs() {
        let inputs = Value::map([
            ("text", Value::from("alpha\n\nbeta\n\ngamma")),
            ("chunk_size", Value::UInt(12)),
        ]);
        let out = split_text(inputs).await.unwrap();
        let chunks = out.get("chunks").unwrap().as_array().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].as_str(), Some("alpha\n\nbeta"));
        assert_eq!(chunks[1].as_str(), Some("gamma"));
    }

    #[tokio::test]
    async fn split_text_requires_text() {
        let err = split_text(Value::Null).await.unwrap_err();
        assert_eq!(err.kind, ailoy_types::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn http_request_roundtrip() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .and(header("x-key", "abc"))
            .respond_with(ResponseTemplate::new(201).set_body_string("created"))
            .mount(&server)
            .await;

        let inputs = Value::map([
            ("url", Value::from(format!("{}/submit", server.uri()))),
            ("method", Value::from("POST")),
            (
                "headers",
                Value::map([("x-key", Value::from("abc"))]),
            ),
            ("body", Value::from("payload")),
        ]);
        let out = http_request(inputs).await.unwrap();
        assert_eq!(out.get("status_code").unwrap().as_u64(), Some(201));
        assert_eq!(out.get("body").unwrap().as_bytes(), Some(&b"created"[..]));
    }
}
