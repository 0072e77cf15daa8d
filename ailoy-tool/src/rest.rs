//! REST-template and builtin-operator tools.
//!
//! Both dispatch through the runtime: REST tools via the `http_request`
//! operator, builtin tools via the operator they name. Results are
//! optionally reduced with a JMESPath `outputPath`.

use std::collections::HashSet;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;
use tracing::debug;

use ailoy_broker::Runtime;
use ailoy_types::{HttpMethod, ToolBehavior, ToolDefinition, ToolDesc, Value};

use crate::jmespath;
use crate::{Tool, ToolError, ToolFuture};

/// A buildable HTTP request, before and after authentication.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequestParts {
    /// Fully expanded URL, query included.
    pub url: String,
    /// HTTP method.
    pub method: HttpMethod,
    /// Request headers.
    pub headers: IndexMap<String, String>,
    /// Request body, when the tool has a body template.
    pub body: Option<String>,
}

/// A pure request transform injected at registration time, e.g. bearer
/// or query-parameter credentials.
pub type Authenticator = Arc<dyn Fn(HttpRequestParts) -> HttpRequestParts + Send + Sync>;

/// Bearer-token authenticator.
pub fn bearer_authenticator(token: impl Into<String>) -> Authenticator {
    let token = token.into();
    Arc::new(move |mut parts| {
        parts
            .headers
            .insert("authorization".into(), format!("Bearer {token}"));
        parts
    })
}

/// Query-parameter API-key authenticator.
pub fn query_param_authenticator(name: impl Into<String>, key: impl Into<String>) -> Authenticator {
    let name = name.into();
    let key = key.into();
    Arc::new(move |mut parts| {
        if let Ok(mut url) = url::Url::parse(&parts.url) {
            url.query_pairs_mut().append_pair(&name, &key);
            parts.url = url.to_string();
        }
        parts
    })
}

/// Expand `${name}` placeholders, recording which names were consumed.
fn expand_template(template: &str, input: &Value, used: &mut HashSet<String>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                used.insert(name.to_owned());
                if let Some(value) = input.get(name) {
                    output.push_str(&value_to_string(value));
                }
                rest = &after[end + 1..];
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    output
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        other => other.to_json(),
    }
}

/// Read an `http_request` response body: raw bytes in-process, base64
/// after a JSON boundary crossing.
fn body_bytes(value: &Value) -> Vec<u8> {
    match value {
        Value::Bytes(bytes) => bytes.clone(),
        Value::Str(text) => BASE64
            .decode(text.as_bytes())
            .unwrap_or_else(|_| text.as_bytes().to_vec()),
        _ => Vec::new(),
    }
}

fn project(output_path: &Option<String>, value: Value) -> Result<Value, ToolError> {
    match output_path {
        Some(path) => jmespath::search(path, &value),
        None => Ok(value),
    }
}

/// A tool that performs a templated HTTP request.
pub struct RestApiTool {
    desc: ToolDesc,
    base_url: String,
    method: HttpMethod,
    headers: IndexMap<String, String>,
    body: Option<String>,
    output_path: Option<String>,
    authenticator: Option<Authenticator>,
    runtime: Runtime,
}

impl RestApiTool {
    /// Build from a `restapi` definition.
    pub fn from_definition(
        definition: &ToolDefinition,
        runtime: Runtime,
        authenticator: Option<Authenticator>,
    ) -> Result<Self, ToolError> {
        let ToolDefinition::Restapi {
            description,
            base_url,
            method,
            headers,
            body,
            behavior,
        } = definition
        else {
            return Err(ToolError::InvalidInput("not a restapi definition".into()));
        };
        Ok(Self {
            desc: description.clone(),
            base_url: base_url.clone(),
            method: *method,
            headers: headers.clone(),
            body: body.clone(),
            output_path: behavior
                .as_ref()
                .and_then(|b: &ToolBehavior| b.output_path.clone()),
            authenticator,
            runtime,
        })
    }

    /// Build the request for `input`: expand path and body templates,
    /// push leftover inputs into the query string, then authenticate.
    pub fn build_request(&self, input: &Value) -> Result<HttpRequestParts, ToolError> {
        let mut used = HashSet::new();
        let url = expand_template(&self.base_url, input, &mut used);
        let body = self
            .body
            .as_ref()
            .map(|template| expand_template(template, input, &mut used));

        let mut url = url::Url::parse(&url)
            .map_err(|e| ToolError::InvalidInput(format!("bad url {url:?}: {e}")))?;
        if let Some(entries) = input.as_map() {
            for (name, value) in entries {
                if !used.contains(name) && !value.is_null() {
                    url.query_pairs_mut()
                        .append_pair(name, &value_to_string(value));
                }
            }
        }

        let mut parts = HttpRequestParts {
            url: url.to_string(),
            method: self.method,
            headers: self.headers.clone(),
            body,
        };
        if let Some(authenticate) = &self.authenticator {
            parts = authenticate(parts);
        }
        Ok(parts)
    }

    fn expects_json(&self) -> bool {
        self.headers
            .iter()
            .any(|(name, value)| {
                name.eq_ignore_ascii_case("accept") && value.starts_with("application/json")
            })
    }
}

impl Tool for RestApiTool {
    fn desc(&self) -> ToolDesc {
        self.desc.clone()
    }

    fn call(&self, input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let parts = self.build_request(&input)?;
            debug!(url = %parts.url, method = parts.method.as_str(), "rest tool call");

            let mut request = Value::map([
                ("url", Value::Str(parts.url.clone())),
                ("method", Value::from(parts.method.as_str())),
                (
                    "headers",
                    Value::Map(
                        parts
                            .headers
                            .iter()
                            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
                            .collect(),
                    ),
                ),
            ]);
            if let (Some(body), Value::Map(entries)) = (&parts.body, &mut request) {
                entries.insert("body".into(), Value::from(body.as_str()));
            }

            let response = self
                .runtime
                .call("http_request", request)
                .await
                .map_err(|e| ToolError::Execution(format!("http_request failed: {e}")))?;

            let status = response
                .get("status_code")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let bytes = response
                .get("body")
                .map(body_bytes)
                .unwrap_or_default();
            if !(200..300).contains(&status) {
                return Err(ToolError::Execution(format!(
                    "http {status} from {}: {}",
                    parts.url,
                    String::from_utf8_lossy(&bytes)
                )));
            }

            let payload = if self.expects_json() {
                Value::from_json(&String::from_utf8_lossy(&bytes))
                    .map_err(|e| ToolError::Execution(format!("response is not JSON: {e}")))?
            } else {
                Value::Bytes(bytes)
            };
            project(&self.output_path, payload)
        })
    }
}

/// A tool that invokes a VM operator by name.
pub struct BuiltinTool {
    desc: ToolDesc,
    operator: String,
    output_path: Option<String>,
    runtime: Runtime,
}

impl BuiltinTool {
    /// Build from a `builtin` definition.
    pub fn from_definition(
        definition: &ToolDefinition,
        runtime: Runtime,
    ) -> Result<Self, ToolError> {
        let ToolDefinition::Builtin {
            description,
            operator,
            behavior,
        } = definition
        else {
            return Err(ToolError::InvalidInput("not a builtin definition".into()));
        };
        Ok(Self {
            desc: description.clone(),
            operator: operator.clone(),
            output_path: behavior.as_ref().and_then(|b| b.output_path.clone()),
            runtime,
        })
    }
}

impl Tool for BuiltinTool {
    fn desc(&self) -> ToolDesc {
        self.desc.clone()
    }

    fn call(&self, input: Value) -> ToolFuture<'_> {
        Box::pin(async move {
            let result = self
                .runtime
                .call(&self.operator, input)
                .await
                .map_err(|e| ToolError::Execution(format!("{} failed: {e}", self.operator)))?;
            project(&self.output_path, result)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weather_definition() -> ToolDefinition {
        serde_json::from_str(
            r#"{
                "type": "restapi",
                "description": {
                    "name": "get_weather",
                    "description": "weather by city",
                    "parameters": {
                        "type": "object",
                        "properties": {"city": {"type": "string"}, "units": {"type": "string"}},
                        "required": ["city"]
                    }
                },
                "baseURL": "https://api.example.com/weather/${city}",
                "method": "GET",
                "headers": {"accept": "application/json"},
                "behavior": {"outputPath": "current.temperature"}
            }"#,
        )
        .unwrap()
    }

    // Request-building tests never send; the broker handle just keeps the
    // endpoint alive for the duration of the test.
    fn runtime_stub(url: &str) -> (ailoy_broker::BrokerHandle, Runtime) {
        let broker = ailoy_broker::spawn(url).unwrap();
        let runtime = Runtime::connect(url).unwrap();
        (broker, runtime)
    }

    #[tokio::test]
    async fn path_params_expand_and_leftovers_become_query() {
        let (_broker, runtime) = runtime_stub("inproc://tool-build-query");
        let tool = RestApiTool::from_definition(&weather_definition(), runtime, None).unwrap();
        let parts = tool
            .build_request(&Value::map([
                ("city", Value::from("Seoul")),
                ("units", Value::from("metric")),
            ]))
            .unwrap();
        assert_eq!(
            parts.url,
            "https://api.example.com/weather/Seoul?units=metric"
        );
        assert_eq!(parts.method, HttpMethod::Get);
        assert!(parts.body.is_none());
    }

    #[tokio::test]
    async fn body_template_consumes_its_parameters() {
        let definition: ToolDefinition = serde_json::from_str(
            r#"{
                "type": "restapi",
                "description": {
                    "name": "post_note",
                    "description": "posts a note",
                    "parameters": {"type": "object", "properties": {}}
                },
                "baseURL": "https://api.example.com/notes",
                "method": "POST",
                "headers": {},
                "body": "{\"text\": \"${text}\"}"
            }"#,
        )
        .unwrap();
        let (_broker, runtime) = runtime_stub("inproc://tool-build-body");
        let tool = RestApiTool::from_definition(&definition, runtime, None).unwrap();
        let parts = tool
            .build_request(&Value::map([("text", Value::from("hello"))]))
            .unwrap();
        // Consumed by the body template, so not a query parameter.
        assert_eq!(parts.url, "https://api.example.com/notes");
        assert_eq!(parts.body.as_deref(), Some(r#"{"text": "hello"}"#));
    }

    #[tokio::test]
    async fn bearer_authenticator_adds_header() {
        let (_broker, runtime) = runtime_stub("inproc://tool-build-bearer");
        let tool = RestApiTool::from_definition(
            &weather_definition(),
            runtime,
            Some(bearer_authenticator("secret")),
        )
        .unwrap();
        let parts = tool
            .build_request(&Value::map([("city", Value::from("Oslo"))]))
            .unwrap();
        assert_eq!(
            parts.headers.get("authorization").map(String::as_str),
            Some("Bearer secret")
        );
    }

    #[tokio::test]
    async fn query_param_authenticator_appends_key() {
        let (_broker, runtime) = runtime_stub("inproc://tool-build-apikey");
        let tool = RestApiTool::from_definition(
            &weather_definition(),
            runtime,
            Some(query_param_authenticator("api_key", "k123")),
        )
        .unwrap();
        let parts = tool
            .build_request(&Value::map([("city", Value::from("Oslo"))]))
            .unwrap();
        assert!(parts.url.contains("api_key=k123"));
    }

    #[tokio::test]
    async fn rest_call_parses_json_and_projects() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        // Full path: registry → runtime → broker → vm http_request → mock server.
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weather/Seoul"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "current": {"temperature": 21.5}
            })))
            .mount(&server)
            .await;

        let url = "inproc://tool-rest-e2e";
        let _broker = ailoy_broker::spawn(url).unwrap();
        let _vm = ailoy_vm::spawn(url, ailoy_vm::builtins()).unwrap();
        let runtime = Runtime::connect(url).unwrap();

        let mut definition = weather_definition();
        if let ToolDefinition::Restapi { base_url, .. } = &mut definition {
            *base_url = format!("{}/weather/${{city}}", server.uri());
        }
        let tool = RestApiTool::from_definition(&definition, runtime, None).unwrap();
        let out = tool
            .call(Value::map([("city", Value::from("Seoul"))]))
            .await
            .unwrap();
        assert_eq!(out, Value::Double(21.5));
    }

    #[tokio::test]
    async fn rest_call_surfaces_http_errors() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/weather/Nowhere"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such city"))
            .mount(&server)
            .await;

        let url = "inproc://tool-rest-err";
        let _broker = ailoy_broker::spawn(url).unwrap();
        let _vm = ailoy_vm::spawn(url, ailoy_vm::builtins()).unwrap();
        let runtime = Runtime::connect(url).unwrap();

        let mut definition = weather_definition();
        if let ToolDefinition::Restapi { base_url, .. } = &mut definition {
            *base_url = format!("{}/weather/${{city}}", server.uri());
        }
        let tool = RestApiTool::from_definition(&definition, runtime, None).unwrap();
        let err = tool
            .call(Value::map([("city", Value::from("Nowhere"))]))
            .await
            .unwrap_err();
        match err {
            ToolError::Execution(message) => {
                assert!(message.contains("404"));
                assert!(message.contains("no such city"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
