//! Step-by-step comparison of two episodes.
//!
//! Steps are aligned positionally (index 0 against index 0, and so on) up
//! to the shorter sequence's length; there is no identity or content
//! matching. Deltas are right minus left throughout — left is the baseline.

use serde::{Deserialize, Serialize};

use crate::episode::{round_cost, Episode, Step};

/// Rendering used for an absent value in a field comparison. Distinct from
/// any real value, so None vs Some("none") still registers as a mismatch
/// only when the strings differ.
const ABSENT: &str = "none";

const COMPARE_FIELDS: [&str; 6] = [
    "step_type",
    "tool_name",
    "model",
    "provider",
    "input_summary",
    "output_summary",
];

/// One field-level mismatch between the steps at `step_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDiff {
    pub step_index: u32,
    pub field: String,
    pub left: String,
    pub right: String,
}

/// Result of comparing two episodes step-by-step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeDiff {
    pub left_episode_id: String,
    pub right_episode_id: String,
    pub left_step_count: u64,
    pub right_step_count: u64,
    pub matching_steps: u64,
    pub differing_steps: u64,
    pub extra_left: u64,
    pub extra_right: u64,
    pub token_delta: i64,
    pub cost_delta: f64,
    pub duration_delta: i64,
    pub step_diffs: Vec<StepDiff>,
}

fn field_value(step: &Step, field: &str) -> String {
    let text = match field {
        "step_type" => Some(step.kind.as_str()),
        "tool_name" => step.tool_name.as_deref(),
        "model" => step.model.as_deref(),
        "provider" => step.provider.as_deref(),
        "input_summary" => step.input_summary.as_deref(),
        "output_summary" => step.output_summary.as_deref(),
        _ => None,
    };
    text.unwrap_or(ABSENT).to_string()
}

/// Purely functional: no persisted side effect.
pub fn diff_episodes(left: &Episode, right: &Episode) -> EpisodeDiff {
    let mut step_diffs = Vec::new();
    let mut matching = 0u64;
    let mut differing = 0u64;

    let compared = left.steps.len().min(right.steps.len());
    for i in 0..compared {
        let (ls, rs) = (&left.steps[i], &right.steps[i]);
        let mut step_has_diff = false;
        for field in COMPARE_FIELDS {
            let lv = field_value(ls, field);
            let rv = field_value(rs, field);
            if lv != rv {
                step_diffs.push(StepDiff {
                    step_index: i as u32,
                    field: field.to_string(),
                    left: lv,
                    right: rv,
                });
                step_has_diff = true;
            }
        }
        if step_has_diff {
            differing += 1;
        } else {
            matching += 1;
        }
    }

    let left_count = left.steps.len() as u64;
    let right_count = right.steps.len() as u64;

    EpisodeDiff {
        left_episode_id: left.episode_id.clone(),
        right_episode_id: right.episode_id.clone(),
        left_step_count: left_count,
        right_step_count: right_count,
        matching_steps: matching,
        differing_steps: differing,
        extra_left: left_count.saturating_sub(right_count),
        extra_right: right_count.saturating_sub(left_count),
        token_delta: right.total_tokens as i64 - left.total_tokens as i64,
        cost_delta: round_cost(right.total_cost_usd - left.total_cost_usd),
        duration_delta: right.total_duration_ms as i64 - left.total_duration_ms as i64,
        step_diffs,
    }
}

#[cfg(test)]
mod tests {
    use super::diff_episodes;
    use crate::episode::{Episode, EpisodeStatus, Step, StepKind};

    fn episode(id: &str, steps: Vec<Step>) -> Episode {
        let mut episode = Episode {
            episode_id: id.to_string(),
            agent_id: "agent-a".to_string(),
            status: EpisodeStatus::Success,
            steps,
            tools_used: Vec::new(),
            total_tokens: 0,
            total_cost_usd: 0.0,
            total_duration_ms: 0,
            step_count: 0,
            started_at_ms: 1_700_000_000_000,
            ended_at_ms: Some(1_700_000_000_000),
            metadata: serde_json::Map::new(),
        };
        episode.compute_aggregates();
        episode
    }

    fn llm_step(index: u32, model: &str, tokens: u64, cost: f64) -> Step {
        let mut step = Step::new(index, StepKind::LlmCall);
        step.model = Some(model.to_string());
        step.provider = Some("openai".to_string());
        step.tokens = tokens;
        step.cost_usd = cost;
        step.duration_ms = 500;
        step
    }

    #[test]
    fn identical_episodes_diff_clean() {
        let a = episode("left", vec![llm_step(0, "gpt-4", 100, 0.004)]);
        let b = episode("right", vec![llm_step(0, "gpt-4", 100, 0.004)]);

        let diff = diff_episodes(&a, &b);
        assert_eq!(diff.matching_steps, 1);
        assert_eq!(diff.differing_steps, 0);
        assert_eq!(diff.token_delta, 0);
        assert_eq!(diff.cost_delta, 0.0);
        assert_eq!(diff.duration_delta, 0);
        assert!(diff.step_diffs.is_empty());
    }

    #[test]
    fn self_diff_matches_every_step() {
        let mut tooling = Step::new(1, StepKind::ToolCall);
        tooling.tool_name = Some("web_search".to_string());
        let a = episode("same", vec![llm_step(0, "gpt-4", 100, 0.004), tooling]);

        let diff = diff_episodes(&a, &a);
        assert_eq!(diff.matching_steps, a.step_count);
        assert_eq!(diff.differing_steps, 0);
        assert_eq!(diff.extra_left, 0);
        assert_eq!(diff.extra_right, 0);
    }

    #[test]
    fn model_change_emits_one_field_diff() {
        let a = episode("left", vec![llm_step(0, "gpt-4", 100, 0.004)]);
        let b = episode("right", vec![llm_step(0, "claude-3", 100, 0.004)]);

        let diff = diff_episodes(&a, &b);
        assert_eq!(diff.differing_steps, 1);
        assert_eq!(diff.matching_steps, 0);
        assert_eq!(diff.step_diffs.len(), 1);
        assert_eq!(diff.step_diffs[0].step_index, 0);
        assert_eq!(diff.step_diffs[0].field, "model");
        assert_eq!(diff.step_diffs[0].left, "gpt-4");
        assert_eq!(diff.step_diffs[0].right, "claude-3");
    }

    #[test]
    fn absent_values_render_as_none() {
        let with_tool = {
            let mut step = Step::new(0, StepKind::ToolCall);
            step.tool_name = Some("grep".to_string());
            step
        };
        let without_tool = Step::new(0, StepKind::ToolCall);

        let diff = diff_episodes(
            &episode("left", vec![with_tool]),
            &episode("right", vec![without_tool]),
        );
        assert_eq!(diff.step_diffs.len(), 1);
        assert_eq!(diff.step_diffs[0].left, "grep");
        assert_eq!(diff.step_diffs[0].right, "none");
    }

    #[test]
    fn length_mismatch_reports_extra_steps_only_on_one_side() {
        let a = episode(
            "left",
            vec![
                llm_step(0, "gpt-4", 100, 0.004),
                llm_step(1, "gpt-4", 50, 0.002),
            ],
        );
        let b = episode("right", vec![llm_step(0, "gpt-4", 100, 0.004)]);

        let diff = diff_episodes(&a, &b);
        assert_eq!(diff.left_step_count, 2);
        assert_eq!(diff.right_step_count, 1);
        assert_eq!(diff.extra_left, 1);
        assert_eq!(diff.extra_right, 0);
        // The trailing left step is not field-compared.
        assert_eq!(diff.matching_steps + diff.differing_steps, 1);
    }

    #[test]
    fn deltas_are_right_minus_left() {
        let a = episode("left", vec![llm_step(0, "gpt-4", 100, 0.004)]);
        let b = episode("right", vec![llm_step(0, "gpt-4", 250, 0.010)]);

        let diff = diff_episodes(&a, &b);
        assert_eq!(diff.token_delta, 150);
        assert_eq!(diff.cost_delta, 0.006);
        assert_eq!(diff.duration_delta, 0);
    }

    #[test]
    fn diff_is_antisymmetric() {
        let a = episode(
            "left",
            vec![llm_step(0, "gpt-4", 100, 0.004), llm_step(1, "gpt-4", 10, 0.001)],
        );
        let b = episode("right", vec![llm_step(0, "claude-3", 300, 0.020)]);

        let forward = diff_episodes(&a, &b);
        let backward = diff_episodes(&b, &a);

        assert_eq!(forward.token_delta, -backward.token_delta);
        assert_eq!(forward.cost_delta, -backward.cost_delta);
        assert_eq!(forward.duration_delta, -backward.duration_delta);
        assert_eq!(forward.extra_left, backward.extra_right);
        assert_eq!(forward.extra_right, backward.extra_left);

        let mut forward_pairs: Vec<(u32, String, String, String)> = forward
            .step_diffs
            .iter()
            .map(|d| (d.step_index, d.field.clone(), d.left.clone(), d.right.clone()))
            .collect();
        let mut backward_swapped: Vec<(u32, String, String, String)> = backward
            .step_diffs
            .iter()
            .map(|d| (d.step_index, d.field.clone(), d.right.clone(), d.left.clone()))
            .collect();
        forward_pairs.sort();
        backward_swapped.sort();
        assert_eq!(forward_pairs, backward_swapped);
    }
}
