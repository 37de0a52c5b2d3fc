//! JSON schemas and task instructions handed to the generator for each agent.

use serde_json::{json, Value};

use toolsmith_core::AgentName;

fn string_array() -> Value {
    json!({ "type": "array", "items": { "type": "string" } })
}

fn object(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

/// Schema of the object an agent must return.
pub fn agent_output_schema(agent: AgentName) -> Value {
    match agent {
        AgentName::FunctionPlanner => object(
            json!({
                "signatures": {
                    "type": "array",
                    "items": object(
                        json!({
                            "name": { "type": "string" },
                            "description": { "type": "string" },
                            "parameters": string_array(),
                            "return_type": { "type": ["string", "null"] },
                        }),
                        &["name", "description", "parameters", "return_type"],
                    ),
                }
            }),
            &["signatures"],
        ),
        AgentName::StateDesigner => object(
            json!({
                "state_variables": {
                    "type": "array",
                    "items": object(
                        json!({
                            "name": { "type": "string" },
                            "initial_value": { "type": "string" },
                            "description": { "type": "string" },
                        }),
                        &["name", "initial_value", "description"],
                    ),
                },
                "functions": {
                    "type": "array",
                    "items": object(
                        json!({ "name": { "type": "string" }, "logic": { "type": "string" } }),
                        &["name", "logic"],
                    ),
                },
            }),
            &["state_variables", "functions"],
        ),
        AgentName::JsxLayout => object(
            json!({
                "component_structure": { "type": "string" },
                "element_map": {
                    "type": "array",
                    "items": object(
                        json!({
                            "element_id": { "type": "string" },
                            "element_type": { "type": "string" },
                            "purpose": { "type": "string" },
                        }),
                        &["element_id", "element_type", "purpose"],
                    ),
                },
            }),
            &["component_structure", "element_map"],
        ),
        AgentName::TailwindStyling => object(
            json!({
                "styled_component_code": { "type": "string" },
                "style_map": { "type": "object", "additionalProperties": { "type": "string" } },
            }),
            &["styled_component_code", "style_map"],
        ),
        AgentName::ComponentAssembler => object(
            json!({
                "final_component_code": { "type": "string" },
                "imports": string_array(),
                "hooks": string_array(),
            }),
            &["final_component_code", "imports", "hooks"],
        ),
        AgentName::CodeValidator => object(
            json!({
                "is_valid": { "type": "boolean" },
                "errors": {
                    "type": "array",
                    "items": object(
                        json!({ "message": { "type": "string" }, "line": { "type": ["integer", "null"] } }),
                        &["message", "line"],
                    ),
                },
                "warnings": string_array(),
            }),
            &["is_valid", "errors", "warnings"],
        ),
        AgentName::ToolFinalizer => object(
            json!({
                "slug": { "type": "string" },
                "title": { "type": "string" },
                "description": { "type": "string" },
                "component_code": { "type": "string" },
            }),
            &["slug", "title", "description", "component_code"],
        ),
    }
}

pub fn agent_task(agent: AgentName) -> &'static str {
    match agent {
        AgentName::FunctionPlanner => {
            "List the functions the component needs, with parameters and return types."
        }
        AgentName::StateDesigner => {
            "Design the React state variables and the logic of every planned function."
        }
        AgentName::JsxLayout => "Design the JSX structure of the component without styling.",
        AgentName::TailwindStyling => "Apply Tailwind CSS classes to the layout and return the styled JSX.",
        AgentName::ComponentAssembler => {
            "Combine state logic and styled JSX into one complete React component."
        }
        AgentName::CodeValidator => {
            "Review the assembled component for syntax and logic errors. Set is_valid to false if any error would break rendering."
        }
        AgentName::ToolFinalizer => "Produce the final tool definition with slug, title and component code.",
    }
}

pub const AGENT_SYSTEM_PROMPT: &str =
    "You are one stage of a pipeline that builds single-file React tools. Reply only with JSON matching the schema.";

pub fn analysis_schema() -> Value {
    object(
        json!({
            "recommended_type": { "type": "string", "enum": ["api", "function", "scraping", "unknown"] },
            "strategy_details": { "type": "string" },
            "warnings": string_array(),
            "extracted_api_endpoint": { "type": ["string", "null"] },
            "required_credential_name": { "type": ["string", "null"] },
            "target_domain": { "type": ["string", "null"] },
            "scraping_method_hint": { "type": ["string", "null"] },
            "requires_auth": { "type": ["boolean", "null"] },
        }),
        &[
            "recommended_type",
            "strategy_details",
            "warnings",
            "extracted_api_endpoint",
            "required_credential_name",
            "target_domain",
            "scraping_method_hint",
            "requires_auth",
        ],
    )
}

pub const ANALYSIS_SYSTEM_PROMPT: &str = "You recommend how a tool should obtain its data: a documented API, a pure function, or web scraping. Base the decision on the research findings. Reply only with JSON matching the schema.";

#[cfg(test)]
mod tests {
    use super::*;

    const AGENTS: [AgentName; 7] = [
        AgentName::FunctionPlanner,
        AgentName::StateDesigner,
        AgentName::JsxLayout,
        AgentName::TailwindStyling,
        AgentName::ComponentAssembler,
        AgentName::CodeValidator,
        AgentName::ToolFinalizer,
    ];

    #[test]
    fn every_agent_schema_is_a_closed_object() {
        for agent in AGENTS {
            let schema = agent_output_schema(agent);
            assert_eq!(schema["type"], "object", "{agent}");
            assert_eq!(schema["additionalProperties"], false, "{agent}");
            let props = schema["properties"].as_object().unwrap();
            let required: Vec<&str> = schema["required"].as_array().unwrap().iter().filter_map(Value::as_str).collect();
            for key in props.keys() {
                assert!(required.contains(&key.as_str()), "{agent}: {key} not required");
            }
        }
    }

    #[test]
    fn analysis_schema_excludes_error_type() {
        let schema = analysis_schema();
        let types = schema["properties"]["recommended_type"]["enum"].as_array().unwrap();
        assert!(!types.iter().any(|t| t == "error"));
    }
}
