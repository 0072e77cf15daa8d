//! Tool descriptors and registration-time definitions.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// What the model sees about a tool: name, description, and a JSON-schema
/// object describing the parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDesc {
    /// Unique tool name within an agent.
    pub name: String,
    /// What the tool does, phrased for the model.
    pub description: String,
    /// JSON-schema object for the arguments.
    pub parameters: Value,
    /// Optional JSON-schema node describing the return value.
    #[serde(rename = "return", skip_serializing_if = "Option::is_none")]
    pub returns: Option<Value>,
}

impl ToolDesc {
    /// Names of parameters listed as `required` in the schema.
    pub fn required_parameters(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|names| names.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// HTTP method for a REST tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// HTTP GET.
    Get,
    /// HTTP POST.
    Post,
    /// HTTP PUT.
    Put,
    /// HTTP PATCH.
    Patch,
    /// HTTP DELETE.
    Delete,
}

impl HttpMethod {
    /// The method name as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// Post-processing applied to a tool's raw result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolBehavior {
    /// JMESPath projection applied to the raw result.
    #[serde(rename = "outputPath", skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
}

/// Registration-time definition of how a tool executes.
///
/// This is the shape bundled preset files use, hence the camelCase field
/// names on the wire.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolDefinition {
    /// Delegates to a VM operator by name.
    Builtin {
        /// What the model sees.
        description: ToolDesc,
        /// The VM operator to invoke.
        operator: String,
        /// Result post-processing.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        behavior: Option<ToolBehavior>,
    },
    /// Templated HTTP request.
    Restapi {
        /// What the model sees.
        description: ToolDesc,
        /// URL template with `${name}` placeholders.
        #[serde(rename = "baseURL")]
        base_url: String,
        /// HTTP method.
        method: HttpMethod,
        /// Fixed request headers.
        #[serde(default)]
        headers: indexmap::IndexMap<String, String>,
        /// Optional body template with `${name}` placeholders.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        /// Result post-processing.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        behavior: Option<ToolBehavior>,
    },
}

impl ToolDefinition {
    /// The descriptor shown to the model.
    pub fn description(&self) -> &ToolDesc {
        match self {
            ToolDefinition::Builtin { description, .. } => description,
            ToolDefinition::Restapi { description, .. } => description,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weather_desc() -> ToolDesc {
        ToolDesc {
            name: "get_weather".into(),
            description: "Current weather for a city".into(),
            parameters: Value::from_json(
                r#"{"type":"object","properties":{"city":{"type":"string"}},"required":["city"]}"#,
            )
            .unwrap(),
            returns: None,
        }
    }

    #[test]
    fn required_parameters_come_from_schema() {
        assert_eq!(weather_desc().required_parameters(), vec!["city"]);
    }

    #[test]
    fn restapi_definition_parses_preset_shape() {
        let json = r#"{
            "type": "restapi",
            "description": {
                "name": "get_weather",
                "description": "Current weather for a city",
                "parameters": {"type": "object", "properties": {"city": {"type": "string"}}}
            },
            "baseURL": "https://api.example.com/weather/${city}",
            "method": "GET",
            "headers": {"accept": "application/json"},
            "behavior": {"outputPath": "current.temperature"}
        }"#;
        let def: ToolDefinition = serde_json::from_str(json).unwrap();
        match &def {
            ToolDefinition::Restapi {
                base_url,
                method,
                headers,
                behavior,
                ..
            } => {
                assert_eq!(base_url, "https://api.example.com/weather/${city}");
                assert_eq!(*method, HttpMethod::Get);
                assert_eq!(headers.get("accept").map(String::as_str), Some("application/json"));
                assert_eq!(
                    behavior.as_ref().unwrap().output_path.as_deref(),
                    Some("current.temperature")
                );
            }
            other => panic!("unexpected definition: {other:?}"),
        }
    }

    #[test]
    fn builtin_definition_roundtrips() {
        let def = ToolDefinition::Builtin {
            description: weather_desc(),
            operator: "http_request".into(),
            behavior: None,
        };
        let json = serde_json::to_string(&def).unwrap();
        let back: ToolDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, def);
    }
}
