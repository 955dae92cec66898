//! Judge request/verdict types and tolerant parsing of judge responses

use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::models::{JudgeResult, ScoringCategory, SlotVerdict, TokenUsage};
use crate::prompts::candidate_label;

/// One candidate output put before the judge
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub slot_index: usize,
    pub output: String,
}

/// Everything a backend needs to run one judge call
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeRequest {
    pub context: String,
    pub candidates: Vec<Candidate>,
    pub model: String,
    pub system_prompt: Option<String>,
    pub evaluation_prompt: Option<String>,
    pub categories: Vec<ScoringCategory>,
}

/// Scores for the candidate at the same position in the request
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateVerdict {
    pub scores: BTreeMap<String, f64>,
    pub reasoning: String,
}

/// Parsed judge answer, positions relative to `JudgeRequest::candidates`
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeVerdict {
    pub candidates: Vec<CandidateVerdict>,
    /// Candidate position of the stated winner; `None` is a tie
    pub winner: Option<usize>,
    pub winner_reasoning: String,
    pub usage: TokenUsage,
}

impl JudgeVerdict {
    /// Map candidate positions back to slot indices.
    ///
    /// The stated winner is carried over as-is; totals never override it.
    pub fn into_result(self, candidates: &[Candidate]) -> Result<JudgeResult> {
        if self.candidates.len() != candidates.len() {
            return Err(Error::Protocol(format!(
                "judge scored {} candidates, expected {}",
                self.candidates.len(),
                candidates.len()
            )));
        }

        let winner_index = match self.winner {
            Some(position) => Some(
                candidates
                    .get(position)
                    .map(|c| c.slot_index)
                    .ok_or_else(|| Error::Protocol(format!("winner {position} out of range")))?,
            ),
            None => None,
        };

        let slots = self
            .candidates
            .into_iter()
            .zip(candidates)
            .map(|(verdict, candidate)| SlotVerdict {
                slot_index: candidate.slot_index,
                scores: verdict.scores,
                reasoning: verdict.reasoning,
            })
            .collect();

        Ok(JudgeResult {
            slots,
            winner_index,
            winner_reasoning: self.winner_reasoning,
        })
    }
}

/// Parse judge text that should hold a JSON object, tolerating prose around it
pub fn parse_json_response(response: &str) -> Result<Value> {
    match serde_json::from_str(response) {
        Ok(parsed) => Ok(parsed),
        Err(_) => try_extract_embedded_json(response),
    }
}

/// Try to extract JSON that might be embedded in text
fn try_extract_embedded_json(response: &str) -> Result<Value> {
    match response.find('{') {
        Some(start) => match response.rfind('}') {
            Some(end) if end > start => serde_json::from_str(&response[start..=end])
                .map_err(|e| Error::Protocol(format!("failed to parse extracted JSON: {e}"))),
            _ => Err(Error::Protocol(
                "found opening brace but no closing brace in judge response".to_string(),
            )),
        },
        None => Err(Error::Protocol("no JSON found in judge response".to_string())),
    }
}

/// Parse a judge verdict for `candidate_count` candidates.
///
/// Candidates may be keyed `modelA`/`modelB` (pairwise proxy) or
/// `model1..modelN`. The winner may be a letter, a 1-based number, or "tie".
pub fn parse_verdict(
    parsed: &Value,
    candidate_count: usize,
    categories: &[ScoringCategory],
) -> Result<JudgeVerdict> {
    let candidates = (0..candidate_count)
        .map(|position| {
            let block = candidate_block(parsed, position).ok_or_else(|| {
                Error::Protocol(format!(
                    "judge response missing model{} / model{}",
                    candidate_label(position),
                    position + 1
                ))
            })?;
            Ok(CandidateVerdict {
                scores: extract_scores(block, categories),
                reasoning: extract_reasoning(block),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let winner_field = parsed
        .get("winner")
        .and_then(|w| match w {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| Error::Protocol("judge response missing winner".to_string()))?;

    Ok(JudgeVerdict {
        candidates,
        winner: parse_winner(&winner_field, candidate_count)?,
        winner_reasoning: parsed
            .get("winnerReasoning")
            .and_then(|r| r.as_str())
            .unwrap_or_default()
            .to_string(),
        usage: parsed
            .get("usage")
            .and_then(|u| serde_json::from_value(u.clone()).ok())
            .unwrap_or_default(),
    })
}

fn candidate_block(parsed: &Value, position: usize) -> Option<&Value> {
    parsed
        .get(format!("model{}", candidate_label(position)))
        .or_else(|| parsed.get(format!("model{}", position + 1)))
        .filter(|v| v.is_object())
}

/// "tie" → `None`; "A"/"B"/... or "1"/"2"/... → candidate position
pub fn parse_winner(winner: &str, candidate_count: usize) -> Result<Option<usize>> {
    let winner = winner.trim();
    if winner.eq_ignore_ascii_case("tie") {
        return Ok(None);
    }

    let position = if let Ok(number) = winner.parse::<usize>() {
        number.checked_sub(1)
    } else {
        let mut chars = winner.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_alphabetic() => {
                Some((c.to_ascii_uppercase() as u8 - b'A') as usize)
            }
            _ => None,
        }
    };

    match position {
        Some(p) if p < candidate_count => Ok(Some(p)),
        _ => Err(Error::Protocol(format!("unrecognized winner {winner:?}"))),
    }
}

/// Scores live either under a nested `scores` object or beside `reasoning`.
/// Each configured category is clamped to its range; a missing or non-numeric
/// score falls back to the category minimum. Without configured categories
/// every numeric field is taken as-is.
fn extract_scores(block: &Value, categories: &[ScoringCategory]) -> BTreeMap<String, f64> {
    let source = block
        .get("scores")
        .and_then(|s| s.as_object())
        .or_else(|| block.as_object());

    let mut scores = BTreeMap::new();
    let Some(source) = source else {
        return scores;
    };

    if categories.is_empty() {
        for (key, value) in source {
            if let Some(score) = value.as_f64() {
                scores.insert(key.clone(), score);
            }
        }
        return scores;
    }

    for category in categories {
        let score = match source.get(&category.key).and_then(|s| s.as_f64()) {
            Some(score) if category.is_valid() => category.clamp(score),
            Some(score) => score,
            None => category.min_score,
        };
        scores.insert(category.key.clone(), score);
    }

    scores
}

fn extract_reasoning(block: &Value) -> String {
    match block.get("reasoning").and_then(|r| r.as_str()) {
        Some(reasoning) => reasoning.to_string(),
        None => "No reasoning provided".to_string(),
    }
}
