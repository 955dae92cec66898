use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::models::{ScoringCategory, slot_label};

/// System prompt used when neither the run file nor the slot supplies one
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a data analyst expert who creates clear, concise, and informative descriptions of datasets and their columns.";

/// Wording adjustment requested on regenerate
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegenerateModifier {
    Concise,
    Detailed,
}

/// Append the regenerate modifier and free-text instruction to a base prompt.
/// Both are optional and compose.
pub fn append_modifiers(
    prompt: &str,
    modifier: Option<RegenerateModifier>,
    custom_instruction: Option<&str>,
) -> String {
    let mut prompt = prompt.to_string();
    match modifier {
        Some(RegenerateModifier::Concise) => prompt.push_str(
            "\n\nIMPORTANT: Make this description MORE CONCISE. Cut filler phrases and combine sentences where possible while keeping the required elements.",
        ),
        Some(RegenerateModifier::Detailed) => prompt.push_str(
            "\n\nIMPORTANT: Make this description MORE DETAILED. Cover every required element in depth with specific examples from the data.",
        ),
        None => {}
    }
    if let Some(instruction) = custom_instruction.map(str::trim).filter(|s| !s.is_empty()) {
        prompt.push_str("\n\nAdditional instruction: ");
        prompt.push_str(instruction);
    }
    prompt
}

/// Build the judge system prompt for `slot_count` candidates scored on `categories`.
///
/// Candidates are keyed `model1..modelN` and the winner is `"1".."N"` or `"tie"`.
pub fn judge_system_prompt(categories: &[ScoringCategory], slot_count: usize) -> String {
    let labels: Vec<String> = (1..=slot_count).map(|i| format!("Model {i}")).collect();

    let category_lines = categories
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "{}. {} ({}-{}) - {}",
                i + 1,
                c.label.to_uppercase(),
                c.min_score,
                c.max_score,
                c.description
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let score_fields = categories
        .iter()
        .map(|c| format!("        \"{}\": <{}-{}>", c.key, c.min_score, c.max_score))
        .collect::<Vec<_>>()
        .join(",\n");

    let model_blocks = labels
        .iter()
        .enumerate()
        .map(|(i, label)| {
            format!(
                "    \"model{}\": {{\n{},\n        \"reasoning\": \"<brief explanation for {} scores>\"\n    }}",
                i + 1,
                score_fields,
                label
            )
        })
        .collect::<Vec<_>>()
        .join(",\n");

    let winner_options = (1..=slot_count)
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "You are an expert evaluator assessing metadata descriptions for open data.\n\
         You will compare {} candidate descriptions ({}) and score each on the following metrics:\n\n\
         {}\n\n\
         You must respond with valid JSON in exactly this format:\n\
         {{\n{},\n    \"winner\": \"<{}, or tie>\",\n    \"winnerReasoning\": \"<1-2 sentence explanation of why this candidate is better or why it's a tie>\"\n}}",
        slot_count,
        labels.join(", "),
        category_lines,
        model_blocks,
        winner_options
    )
}

/// Build the judge's user prompt. A custom template may reference `{context}`
/// and `{output_1}`, `{output_2}`, ... (1-based)
pub fn evaluation_prompt(template: Option<&str>, context: &str, candidates: &[&str]) -> String {
    match template {
        Some(template) => {
            let mut prompt = template.replace("{context}", context);
            for (i, candidate) in candidates.iter().enumerate() {
                prompt = prompt.replace(&format!("{{output_{}}}", i + 1), candidate);
            }
            prompt
        }
        None => {
            let blocks = candidates
                .iter()
                .enumerate()
                .map(|(i, c)| format!("MODEL {}:\n{}", i + 1, c))
                .collect::<Vec<_>>()
                .join("\n\n");
            format!(
                "CONTEXT:\n{context}\n\n{blocks}\n\nEvaluate all candidates and respond with the JSON structure as specified."
            )
        }
    }
}

/// Label a candidate the way the pairwise judge names it ("A", "B")
pub fn candidate_label(position: usize) -> String {
    slot_label(position)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_modifiers_none() {
        assert_eq!(append_modifiers("Describe it", None, None), "Describe it");
        assert_eq!(append_modifiers("Describe it", None, Some("   ")), "Describe it");
    }

    #[test]
    fn test_append_modifiers_compose() {
        let prompt = append_modifiers(
            "Describe it",
            Some(RegenerateModifier::Concise),
            Some("Mention the county"),
        );
        assert!(prompt.starts_with("Describe it\n\nIMPORTANT: Make this description MORE CONCISE."));
        assert!(prompt.ends_with("\n\nAdditional instruction: Mention the county"));
    }

    #[test]
    fn test_append_modifiers_detailed() {
        let prompt = append_modifiers("p", Some(RegenerateModifier::Detailed), None);
        assert!(prompt.contains("MORE DETAILED"));
        assert!(!prompt.contains("Additional instruction"));
    }

    #[test]
    fn test_judge_system_prompt_lists_categories_and_slots() {
        let prompt = judge_system_prompt(&ScoringCategory::defaults(), 3);
        assert!(prompt.contains("compare 3 candidate descriptions (Model 1, Model 2, Model 3)"));
        assert!(prompt.contains("1. CLARITY (0-10) - How clear and understandable"));
        assert!(prompt.contains("\"model3\": {"));
        assert!(prompt.contains("\"plainLanguage\": <0-10>"));
        assert!(prompt.contains("\"winner\": \"<1, 2, 3, or tie>\""));
    }

    #[test]
    fn test_evaluation_prompt_default_and_template() {
        let default = evaluation_prompt(None, "ctx", &["first", "second"]);
        assert!(default.starts_with("CONTEXT:\nctx\n\nMODEL 1:\nfirst\n\nMODEL 2:\nsecond"));

        let custom = evaluation_prompt(Some("{context} | {output_2} vs {output_1}"), "ctx", &["a", "b"]);
        assert_eq!(custom, "ctx | b vs a");
    }
}
