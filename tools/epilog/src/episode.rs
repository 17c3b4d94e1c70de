//! Episode data model.
//!
//! An episode is the complete record of one agent task run: an ordered
//! sequence of steps (LLM calls, tool invocations, decisions) plus
//! aggregates derived from them. Episodes are immutable once created.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::EpilogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Running,
    Success,
    Failure,
    Timeout,
    Killed,
}

impl EpisodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Timeout => "timeout",
            Self::Killed => "killed",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failure" => Some(Self::Failure),
            "timeout" => Some(Self::Timeout),
            "killed" => Some(Self::Killed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    LlmCall,
    ToolCall,
    ToolResult,
    Decision,
    Error,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LlmCall => "llm_call",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
            Self::Decision => "decision",
            Self::Error => "error",
        }
    }
}

/// A single step in an episode's sequence.
///
/// `air_record_id` links back to the raw record in the upstream gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Position in the episode sequence (0-based).
    pub step_index: u32,
    #[serde(rename = "step_type")]
    pub kind: StepKind,
    #[serde(default)]
    pub air_record_id: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub input_summary: Option<String>,
    #[serde(default)]
    pub output_summary: Option<String>,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub duration_ms: u64,
    /// Epoch milliseconds. Stamped at creation when not supplied.
    #[serde(default)]
    pub timestamp_ms: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Step {
    /// An empty step of the given kind at the given position.
    pub fn new(step_index: u32, kind: StepKind) -> Self {
        Self {
            step_index,
            kind,
            air_record_id: None,
            tool_name: None,
            model: None,
            provider: None,
            input_summary: None,
            output_summary: None,
            tokens: 0,
            cost_usd: 0.0,
            duration_ms: 0,
            timestamp_ms: None,
            error: None,
            metadata: Map::new(),
        }
    }
}

/// Ingest payload: the caller supplies agent, steps, and outcome wholesale.
/// The store assigns the episode id and timestamps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEpisode {
    pub agent_id: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default = "default_status")]
    pub status: EpisodeStatus,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_status() -> EpisodeStatus {
    EpisodeStatus::Running
}

impl NewEpisode {
    /// Rejects malformed payloads before any persistence attempt.
    pub fn validate(&self) -> Result<(), EpilogError> {
        if self.agent_id.trim().is_empty() {
            return Err(EpilogError::Validation(
                "agent_id must be non-empty".to_string(),
            ));
        }
        for step in &self.steps {
            if !step.cost_usd.is_finite() || step.cost_usd < 0.0 {
                return Err(EpilogError::Validation(format!(
                    "step {} has negative or non-finite cost_usd",
                    step.step_index
                )));
            }
        }
        Ok(())
    }
}

/// A complete episode as stored and returned by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub episode_id: String,
    pub agent_id: String,
    pub status: EpisodeStatus,
    pub steps: Vec<Step>,
    /// Deduplicated tool names in first-occurrence order.
    pub tools_used: Vec<String>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub total_duration_ms: u64,
    pub step_count: u64,
    pub started_at_ms: i64,
    /// Present iff status != running.
    pub ended_at_ms: Option<i64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Episode {
    /// Recomputes every aggregate from the step sequence. Aggregates are
    /// never patched incrementally.
    pub fn compute_aggregates(&mut self) {
        self.step_count = self.steps.len() as u64;
        self.total_tokens = self.steps.iter().map(|s| s.tokens).sum();
        self.total_cost_usd = round_cost(self.steps.iter().map(|s| s.cost_usd).sum());
        self.total_duration_ms = self.steps.iter().map(|s| s.duration_ms).sum();

        let mut tools = Vec::new();
        for step in &self.steps {
            if let Some(tool) = step.tool_name.as_deref() {
                if !tool.is_empty() && !tools.iter().any(|seen| seen == tool) {
                    tools.push(tool.to_string());
                }
            }
        }
        self.tools_used = tools;
    }

    pub fn summary(&self) -> EpisodeSummary {
        EpisodeSummary {
            episode_id: self.episode_id.clone(),
            agent_id: self.agent_id.clone(),
            status: self.status,
            tools_used: self.tools_used.clone(),
            total_tokens: self.total_tokens,
            total_cost_usd: self.total_cost_usd,
            total_duration_ms: self.total_duration_ms,
            step_count: self.step_count,
            started_at_ms: self.started_at_ms,
            ended_at_ms: self.ended_at_ms,
        }
    }
}

/// Lightweight projection for list views — no steps included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    pub episode_id: String,
    pub agent_id: String,
    pub status: EpisodeStatus,
    pub tools_used: Vec<String>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub total_duration_ms: u64,
    pub step_count: u64,
    pub started_at_ms: i64,
    pub ended_at_ms: Option<i64>,
}

/// Costs are carried in fractional USD; sums round to 6 decimal places.
pub fn round_cost(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}
