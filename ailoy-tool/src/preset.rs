//! Bundled tool presets.
//!
//! Each preset is a JSON asset mapping tool name to its
//! [`ToolDefinition`], compiled into the binary.

use indexmap::IndexMap;

use ailoy_types::ToolDefinition;

use crate::ToolError;

const FRANKFURTER: &str = include_str!("../assets/presets/frankfurter.json");
const OPEN_METEO: &str = include_str!("../assets/presets/open_meteo.json");

/// Load a bundled preset by name.
///
/// # Errors
///
/// `NotFound` for unknown preset names; `InvalidInput` if a bundled asset
/// fails to parse (a packaging defect).
pub fn load_preset(name: &str) -> Result<IndexMap<String, ToolDefinition>, ToolError> {
    let source = match name {
        "frankfurter" => FRANKFURTER,
        "open_meteo" => OPEN_METEO,
        other => return Err(ToolError::NotFound(format!("preset {other}"))),
    };
    serde_json::from_str(source)
        .map_err(|e| ToolError::InvalidInput(format!("preset {name} is malformed: {e}")))
}

/// Names of every bundled preset.
pub fn preset_names() -> &'static [&'static str] {
    &["frankfurter", "open_meteo"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_bundled_preset_parses() {
        for name in preset_names() {
            let preset = load_preset(name).unwrap();
            assert!(!preset.is_empty(), "preset {name} is empty");
            for (tool_name, definition) in &preset {
                assert_eq!(tool_name, &definition.description().name);
            }
        }
    }

    #[test]
    fn unknown_preset_is_not_found() {
        assert!(matches!(
            load_preset("nope"),
            Err(ToolError::NotFound(_))
        ));
    }

    #[test]
    fn frankfurter_preset_is_restapi() {
        let preset = load_preset("frankfurter").unwrap();
        let definition = preset.get("get_exchange_rate").unwrap();
        assert!(matches!(definition, ToolDefinition::Restapi { .. }));
    }
}
