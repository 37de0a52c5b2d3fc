use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Ordered stages of the tool construction pipeline.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Initialization,
    PlanningFunctionSignatures,
    DesigningStateLogic,
    DesigningJsxLayout,
    ApplyingTailwindStyling,
    AssemblingComponent,
    ValidatingCode,
    FinalizingTool,
}

impl PipelineStep {
    pub const ALL: [PipelineStep; 8] = [
        Self::Initialization,
        Self::PlanningFunctionSignatures,
        Self::DesigningStateLogic,
        Self::DesigningJsxLayout,
        Self::ApplyingTailwindStyling,
        Self::AssemblingComponent,
        Self::ValidatingCode,
        Self::FinalizingTool,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialization => "initialization",
            Self::PlanningFunctionSignatures => "planning_function_signatures",
            Self::DesigningStateLogic => "designing_state_logic",
            Self::DesigningJsxLayout => "designing_jsx_layout",
            Self::ApplyingTailwindStyling => "applying_tailwind_styling",
            Self::AssemblingComponent => "assembling_component",
            Self::ValidatingCode => "validating_code",
            Self::FinalizingTool => "finalizing_tool",
        }
    }

    /// Position in the fixed order, starting at zero.
    pub fn index(&self) -> usize {
        Self::ALL.iter().position(|s| s == self).unwrap_or(0)
    }

    pub fn next(&self) -> Option<PipelineStep> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// Agent that executes this step. Initialization is run by the orchestrator itself.
    pub fn agent(&self) -> Option<AgentName> {
        match self {
            Self::Initialization => None,
            Self::PlanningFunctionSignatures => Some(AgentName::FunctionPlanner),
            Self::DesigningStateLogic => Some(AgentName::StateDesigner),
            Self::DesigningJsxLayout => Some(AgentName::JsxLayout),
            Self::ApplyingTailwindStyling => Some(AgentName::TailwindStyling),
            Self::AssemblingComponent => Some(AgentName::ComponentAssembler),
            Self::ValidatingCode => Some(AgentName::CodeValidator),
            Self::FinalizingTool => Some(AgentName::ToolFinalizer),
        }
    }

    /// Field that must be populated once this step succeeds.
    pub fn required_output(&self) -> Option<OutputField> {
        self.agent().map(|a| a.output_field())
    }

    pub fn started_message(&self) -> &'static str {
        match self {
            Self::Initialization => "Initializing tool construction job",
            Self::PlanningFunctionSignatures => "Planning function signatures",
            Self::DesigningStateLogic => "Designing state logic",
            Self::DesigningJsxLayout => "Designing component layout",
            Self::ApplyingTailwindStyling => "Applying Tailwind styling",
            Self::AssemblingComponent => "Assembling component code",
            Self::ValidatingCode => "Validating generated code",
            Self::FinalizingTool => "Finalizing tool definition",
        }
    }

    pub fn completed_message(&self) -> &'static str {
        match self {
            Self::Initialization => "Job initialized",
            Self::PlanningFunctionSignatures => "Function signatures planned",
            Self::DesigningStateLogic => "State logic designed",
            Self::DesigningJsxLayout => "Component layout designed",
            Self::ApplyingTailwindStyling => "Styling applied",
            Self::AssemblingComponent => "Component assembled",
            Self::ValidatingCode => "Code validated",
            Self::FinalizingTool => "Tool finalized",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown pipeline step: {0}")]
pub struct UnknownStep(pub String);

impl FromStr for PipelineStep {
    type Err = UnknownStep;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|step| step.as_str() == s)
            .copied()
            .ok_or_else(|| UnknownStep(s.to_owned()))
    }
}

/// Named generation agents. The string form is the key used in `agent_model_mapping`.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentName {
    FunctionPlanner,
    StateDesigner,
    JsxLayout,
    TailwindStyling,
    ComponentAssembler,
    CodeValidator,
    ToolFinalizer,
}

impl AgentName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FunctionPlanner => "function-planner",
            Self::StateDesigner => "state-designer",
            Self::JsxLayout => "jsx-layout",
            Self::TailwindStyling => "tailwind-styling",
            Self::ComponentAssembler => "component-assembler",
            Self::CodeValidator => "code-validator",
            Self::ToolFinalizer => "tool-finalizer",
        }
    }

    pub fn output_field(&self) -> OutputField {
        match self {
            Self::FunctionPlanner => OutputField::FunctionSignatures,
            Self::StateDesigner => OutputField::StateLogic,
            Self::JsxLayout => OutputField::JsxLayout,
            Self::TailwindStyling => OutputField::Styling,
            Self::ComponentAssembler => OutputField::AssembledComponent,
            Self::CodeValidator => OutputField::ValidationResult,
            Self::ToolFinalizer => OutputField::FinalProduct,
        }
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulated output slots on the construction context.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputField {
    FunctionSignatures,
    StateLogic,
    JsxLayout,
    Styling,
    AssembledComponent,
    ValidationResult,
    FinalProduct,
}

impl OutputField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FunctionSignatures => "function_signatures",
            Self::StateLogic => "state_logic",
            Self::JsxLayout => "jsx_layout",
            Self::Styling => "styling",
            Self::AssembledComponent => "assembled_component",
            Self::ValidationResult => "validation_result",
            Self::FinalProduct => "final_product",
        }
    }
}

impl fmt::Display for OutputField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
