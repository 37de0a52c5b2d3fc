//! Typed outputs produced by each generation agent.
//!
//! Every agent result is deserialized into one of these structs at the invoker
//! boundary, so nothing downstream handles untyped model output.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub return_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateVariable {
    pub name: String,
    #[serde(default)]
    pub initial_value: serde_json::Value,
    #[serde(default)]
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateFunction {
    pub name: String,
    pub logic: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateLogic {
    pub state_variables: Vec<StateVariable>,
    #[serde(default)]
    pub functions: Vec<StateFunction>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayoutElement {
    pub element_id: String,
    pub element_type: String,
    #[serde(default)]
    pub purpose: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JsxLayout {
    pub component_structure: String,
    #[serde(default)]
    pub element_map: Vec<LayoutElement>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Styling {
    pub styled_component_code: String,
    /// Element id to Tailwind class list.
    #[serde(default)]
    pub style_map: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AssembledComponent {
    pub final_component_code: String,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub hooks: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub message: String,
    #[serde(default)]
    pub line: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    #[serde(default)]
    pub errors: Vec<ValidationIssue>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// One-line summary of the reported errors.
    pub fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            return "validator rejected the component without details".into();
        }
        self.errors
            .iter()
            .map(|e| match e.line {
                Some(line) => format!("line {line}: {}", e.message),
                None => e.message.clone(),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinalProduct {
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub component_code: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_optional_fields_default() {
        let sig: FunctionSignature = serde_json::from_str(r#"{"name":"compute"}"#).unwrap();
        assert_eq!(sig.name, "compute");
        assert!(sig.parameters.is_empty());
        assert!(sig.return_type.is_none());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let res: Result<AssembledComponent, _> = serde_json::from_str(r#"{"imports":[]}"#);
        assert!(res.is_err());
    }

    #[test]
    fn error_summary_joins_messages() {
        let result = ValidationResult {
            is_valid: false,
            errors: vec![
                ValidationIssue { message: "unclosed tag".into(), line: Some(12) },
                ValidationIssue { message: "unused import".into(), line: None },
            ],
            warnings: vec![],
        };
        assert_eq!(result.error_summary(), "line 12: unclosed tag; unused import");
    }

    #[test]
    fn error_summary_without_details() {
        let result = ValidationResult { is_valid: false, errors: vec![], warnings: vec![] };
        assert!(result.error_summary().contains("without details"));
    }
}
