//! Replay view of an episode.
//!
//! A replay is a derived, never-persisted rewrite of an episode's step
//! sequence: timestamps and errors are stripped and steps are renumbered
//! 0..n-1 so they can be fed sequentially back through an execution system.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::episode::{Episode, EpisodeStatus, Step, StepKind};

/// One step of a replay sequence. `replay_index` is assigned fresh and is
/// independent of the original `step_index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayStep {
    pub replay_index: u32,
    #[serde(rename = "step_type")]
    pub kind: StepKind,
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
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ReplayStep {
    fn from_step(replay_index: u32, step: &Step) -> Self {
        Self {
            replay_index,
            kind: step.kind,
            tool_name: step.tool_name.clone(),
            model: step.model.clone(),
            provider: step.provider.clone(),
            input_summary: step.input_summary.clone(),
            output_summary: step.output_summary.clone(),
            tokens: step.tokens,
            cost_usd: step.cost_usd,
            duration_ms: step.duration_ms,
            metadata: step.metadata.clone(),
        }
    }
}

/// Replay-ready view of an episode: the renumbered steps plus the
/// aggregates carried over unchanged from the source episode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeReplay {
    pub episode_id: String,
    pub agent_id: String,
    pub original_status: EpisodeStatus,
    pub replay_steps: Vec<ReplayStep>,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
    pub tools_used: Vec<String>,
}

/// Purely functional: no persisted side effect.
pub fn build_replay(episode: &Episode) -> EpisodeReplay {
    let replay_steps = episode
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| ReplayStep::from_step(i as u32, step))
        .collect();

    EpisodeReplay {
        episode_id: episode.episode_id.clone(),
        agent_id: episode.agent_id.clone(),
        original_status: episode.status,
        replay_steps,
        total_tokens: episode.total_tokens,
        total_cost_usd: episode.total_cost_usd,
        tools_used: episode.tools_used.clone(),
    }
}
