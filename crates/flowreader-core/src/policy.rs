//! Prompt & Model Policy (C10) — a pure `Intent -> behavior` table, kept
//! separate from the dialog/auto-note engines so tuning prompts or model
//! tiers never touches control flow (§4.10).

use crate::domain::Intent;
use crate::llm::ModelTier;

#[derive(Debug, Clone, Copy)]
pub struct PolicyEntry {
    pub system_prompt: &'static str,
    pub model_tier: ModelTier,
    pub max_output_tokens: u32,
    pub streaming_required: bool,
}

const MAX_SYSTEM_PROMPT_CHARS: usize = 600;

/// Looks up the fixed policy row for `intent`. `cost_optimized_hint` lets the
/// caller (quota exhaustion, explicit request hint) downgrade tier for
/// anything but `enhance`, which always stays on the primary tier (§4.10).
pub fn policy_for(intent: Intent, cost_optimized_hint: bool) -> PolicyEntry {
    let mut entry = match intent {
        Intent::Translate => PolicyEntry {
            system_prompt: "Translate the given passage faithfully, preserving tone and register. Do not summarize or omit content.",
            model_tier: ModelTier::CostOptimized,
            max_output_tokens: 900,
            streaming_required: true,
        },
        Intent::Explain => PolicyEntry {
            system_prompt: "Explain the passage in plain language for a reader unfamiliar with the surrounding context. Be concise.",
            model_tier: ModelTier::CostOptimized,
            max_output_tokens: 600,
            streaming_required: true,
        },
        Intent::Analyze => PolicyEntry {
            system_prompt: "Analyze the passage: themes, structure, and notable craft choices. Ground every claim in the supplied context.",
            model_tier: ModelTier::Primary,
            max_output_tokens: 800,
            streaming_required: true,
        },
        Intent::Ask | Intent::Question => PolicyEntry {
            system_prompt: "Answer the reader's question using only the supplied book context. If the context is insufficient, say so.",
            model_tier: ModelTier::CostOptimized,
            max_output_tokens: 500,
            streaming_required: true,
        },
        Intent::Enhance => PolicyEntry {
            system_prompt: "Produce a structured, knowledge-enhancing explanation of the selected passage: background, references, and implications.",
            model_tier: ModelTier::Primary,
            max_output_tokens: 1000,
            streaming_required: false,
        },
        Intent::Summarize => PolicyEntry {
            system_prompt: "Summarize the supplied dialog or passage in a few sentences, capturing the reader's intent and any open threads.",
            model_tier: ModelTier::CostOptimized,
            max_output_tokens: 400,
            streaming_required: false,
        },
    };

    debug_assert!(entry.system_prompt.len() <= MAX_SYSTEM_PROMPT_CHARS);

    // `enhance` is quality-critical and always stays on the primary tier;
    // every other intent may be downgraded under quota pressure.
    if cost_optimized_hint && !matches!(intent, Intent::Enhance) {
        entry.model_tier = ModelTier::CostOptimized;
    }

    entry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enhance_stays_primary_even_with_cost_hint() {
        let entry = policy_for(Intent::Enhance, true);
        assert_eq!(entry.model_tier, ModelTier::Primary);
    }

    #[test]
    fn cost_hint_downgrades_other_intents() {
        let entry = policy_for(Intent::Analyze, true);
        assert_eq!(entry.model_tier, ModelTier::CostOptimized);
    }

    #[test]
    fn system_prompts_stay_within_configured_length() {
        for intent in [
            Intent::Translate,
            Intent::Explain,
            Intent::Analyze,
            Intent::Ask,
            Intent::Enhance,
            Intent::Summarize,
            Intent::Question,
        ] {
            assert!(policy_for(intent, false).system_prompt.len() <= MAX_SYSTEM_PROMPT_CHARS);
        }
    }
}
