//! Data model for the implementation-strategy consultation loop.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ToolRequest;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedType {
    Api,
    Function,
    Scraping,
    Unknown,
    Error,
}

impl RecommendedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Function => "function",
            Self::Scraping => "scraping",
            Self::Unknown => "unknown",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for RecommendedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchDepth {
    Basic,
    Deep,
}

/// The identifying subset of a request that decides whether earlier research
/// can be reused. Compared by exact equality.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResearchFingerprint {
    pub name: String,
    pub description: String,
    pub service_name: String,
    #[serde(default)]
    pub target_url: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub recommended_type: RecommendedType,
    pub strategy_details: String,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub extracted_api_endpoint: Option<String>,
    #[serde(default)]
    pub preliminary_findings: String,
    /// Set when any research query behind `preliminary_findings` failed.
    #[serde(default)]
    pub findings_error: bool,
    #[serde(default)]
    pub preliminary_research_for: Option<ResearchFingerprint>,
    #[serde(default)]
    pub required_credential_name: Option<String>,
    #[serde(default)]
    pub target_domain: Option<String>,
    #[serde(default)]
    pub scraping_method_hint: Option<String>,
    #[serde(default)]
    pub requires_auth: Option<bool>,
}

impl AnalysisResult {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            recommended_type: RecommendedType::Error,
            strategy_details: message.into(),
            warnings: Vec::new(),
            extracted_api_endpoint: None,
            preliminary_findings: String::new(),
            findings_error: false,
            preliminary_research_for: None,
            required_credential_name: None,
            target_domain: None,
            scraping_method_hint: None,
            requires_auth: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Success,
    Failure,
    Skipped,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub status: VerificationStatus,
    pub details: String,
}

impl VerificationResult {
    pub fn success(details: impl Into<String>) -> Self {
        Self { status: VerificationStatus::Success, details: details.into() }
    }

    pub fn failure(details: impl Into<String>) -> Self {
        Self { status: VerificationStatus::Failure, details: details.into() }
    }

    pub fn skipped(details: impl Into<String>) -> Self {
        Self { status: VerificationStatus::Skipped, details: details.into() }
    }

    pub fn is_failure(&self) -> bool {
        self.status == VerificationStatus::Failure
    }
}

/// One analysis and verification attempt.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsultationRound {
    pub round: u32,
    #[serde(default)]
    pub modifications_requested: Vec<String>,
    pub analysis: AnalysisResult,
    pub verification: VerificationResult,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConsultationRequest {
    pub request: ToolRequest,
    #[serde(default)]
    pub history: Vec<ConsultationRound>,
    #[serde(default)]
    pub modifications: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsultationOutcome {
    pub analysis: AnalysisResult,
    pub verification: VerificationResult,
    pub rounds: Vec<ConsultationRound>,
}

/// Result of a cheap GET against a target site.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteProbeReport {
    pub is_likely_blocked: bool,
    #[serde(default)]
    pub block_reason: Option<String>,
    #[serde(default)]
    pub auth_detected: bool,
    #[serde(default)]
    pub method_hint: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
}

impl SiteProbeReport {
    pub fn summary(&self, url: &str) -> String {
        let mut out = format!("Site probe for {url}:");
        match self.status {
            Some(code) => out.push_str(&format!(" HTTP {code}.")),
            None => out.push_str(" no response."),
        }
        if self.is_likely_blocked {
            let reason = self.block_reason.as_deref().unwrap_or("unknown reason");
            out.push_str(&format!(" Likely blocked ({reason})."));
        } else {
            out.push_str(" Not blocked.");
        }
        if self.auth_detected {
            out.push_str(" Login form detected.");
        }
        if let Some(hint) = &self.method_hint {
            out.push_str(&format!(" Suggested method: {hint}."));
        }
        out
    }
}
