use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// Token counts billed for one model invocation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64, total_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens.saturating_add(rhs.prompt_tokens),
            completion_tokens: self.completion_tokens.saturating_add(rhs.completion_tokens),
            total_tokens: self.total_tokens.saturating_add(rhs.total_tokens),
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}

impl Sum for TokenUsage {
    fn sum<I: Iterator<Item = TokenUsage>>(iter: I) -> TokenUsage {
        iter.fold(TokenUsage::default(), Add::add)
    }
}

/// Identifies a usage/cancellation owner: one of the model slots or the judge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SlotKey {
    Model(usize),
    Judge,
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKey::Model(index) => write!(f, "model {}", slot_label(*index)),
            SlotKey::Judge => write!(f, "judge"),
        }
    }
}

/// Display label for a slot index: A, B, C, ... then numbers past Z
pub fn slot_label(index: usize) -> String {
    if index < 26 {
        char::from(b'A' + index as u8).to_string()
    } else {
        (index + 1).to_string()
    }
}

/// Per-slot generation status.
///
/// `Generating` and `Regenerating` are the only non-terminal states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotStatus {
    Idle,
    Generating,
    Regenerating,
    Streamed,
    Errored { message: String },
    Aborted,
}

impl SlotStatus {
    /// True while a stream is open for the slot
    pub fn is_in_flight(&self) -> bool {
        matches!(self, SlotStatus::Generating | SlotStatus::Regenerating)
    }

    /// True once the slot finished, successfully or not
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SlotStatus::Streamed | SlotStatus::Errored { .. } | SlotStatus::Aborted
        )
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SlotStatus::Errored { .. } | SlotStatus::Aborted)
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotStatus::Idle => "idle",
            SlotStatus::Generating => "generating",
            SlotStatus::Regenerating => "regenerating",
            SlotStatus::Streamed => "streamed",
            SlotStatus::Errored { .. } => "errored",
            SlotStatus::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// One generation target in a comparison
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slot {
    pub model_index: usize,
    pub model_name: String,
    pub status: SlotStatus,
    /// Text accumulated from the current (or last) stream
    pub output: String,
    /// Cumulative usage across generate and every regenerate
    pub usage: TokenUsage,
}

impl Slot {
    pub fn new(model_index: usize, model_name: impl Into<String>) -> Self {
        Self {
            model_index,
            model_name: model_name.into(),
            status: SlotStatus::Idle,
            output: String::new(),
            usage: TokenUsage::default(),
        }
    }
}

/// A user-configurable rubric axis used by the judge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringCategory {
    pub key: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "min_score")]
    pub min_score: f64,
    #[serde(default = "default_max_score", alias = "max_score")]
    pub max_score: f64,
}

fn default_max_score() -> f64 {
    10.0
}

impl ScoringCategory {
    pub fn new(key: &str, label: &str, description: &str, min_score: f64, max_score: f64) -> Self {
        Self {
            key: key.to_string(),
            label: label.to_string(),
            description: description.to_string(),
            min_score,
            max_score,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.min_score <= self.max_score
    }

    /// Clamp a judge score into this category's range
    pub fn clamp(&self, score: f64) -> f64 {
        score.clamp(self.min_score, self.max_score)
    }

    /// The default rubric: five axes scored 0 to 10
    pub fn defaults() -> Vec<ScoringCategory> {
        vec![
            Self::new(
                "clarity",
                "Clarity",
                "How clear and understandable the description is",
                0.0,
                10.0,
            ),
            Self::new(
                "completeness",
                "Completeness",
                "How thoroughly the description covers the content",
                0.0,
                10.0,
            ),
            Self::new(
                "accuracy",
                "Accuracy",
                "How accurately the description reflects the data",
                0.0,
                10.0,
            ),
            Self::new(
                "conciseness",
                "Conciseness",
                "How concise the description is without losing meaning",
                0.0,
                10.0,
            ),
            Self::new(
                "plainLanguage",
                "Plain Language",
                "How well the description uses plain, accessible language",
                0.0,
                10.0,
            ),
        ]
    }
}

/// Judge scores for one slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotVerdict {
    pub slot_index: usize,
    pub scores: BTreeMap<String, f64>,
    pub reasoning: String,
}

/// The judge's verdict over a whole comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeResult {
    pub slots: Vec<SlotVerdict>,
    /// Winning slot index as stated by the judge; `None` is a tie
    pub winner_index: Option<usize>,
    pub winner_reasoning: String,
}

impl JudgeResult {
    pub fn verdict_for(&self, slot_index: usize) -> Option<&SlotVerdict> {
        self.slots.iter().find(|v| v.slot_index == slot_index)
    }

    /// Summed category scores for a slot. Display only: the winner is always
    /// `winner_index`, never derived from these totals.
    pub fn total_for(&self, slot_index: usize) -> Option<f64> {
        self.verdict_for(slot_index)
            .map(|v| v.scores.values().sum())
    }

    pub fn is_tie(&self) -> bool {
        self.winner_index.is_none()
    }

    pub fn winner_label(&self) -> String {
        match self.winner_index {
            Some(index) => format!("Model {} Wins", slot_label(index)),
            None => "Tie".to_string(),
        }
    }
}

/// Highest achievable total across a rubric
pub fn max_total(categories: &[ScoringCategory]) -> f64 {
    categories.iter().map(|c| c.max_score).sum()
}

/// Overall comparison state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonStatus {
    NotStarted,
    Generating,
    Judging,
    Judged,
    GeneratedNoJudge,
}

impl fmt::Display for ComparisonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComparisonStatus::NotStarted => "not started",
            ComparisonStatus::Generating => "generating",
            ComparisonStatus::Judging => "judging",
            ComparisonStatus::Judged => "judged",
            ComparisonStatus::GeneratedNoJudge => "generated (no judge)",
        };
        f.write_str(name)
    }
}

/// Outputs and verdict of one comparison
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComparisonResult {
    /// One entry per slot, in slot order
    pub outputs: Vec<String>,
    pub judge_result: Option<JudgeResult>,
    pub is_judging: bool,
}

impl ComparisonResult {
    pub fn empty(slot_count: usize) -> Self {
        Self {
            outputs: vec![String::new(); slot_count],
            judge_result: None,
            is_judging: false,
        }
    }
}

/// What a finished generate/regenerate call produced
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub slot_index: usize,
    pub output: String,
    /// Usage of this call only (the slot keeps the cumulative figure)
    pub usage: TokenUsage,
    pub aborted: bool,
}

/// State changes published to subscribers (UI, CLI progress)
#[derive(Debug, Clone, PartialEq)]
pub enum ComparisonEvent {
    SlotStatus { slot_index: usize, status: SlotStatus },
    Delta { slot_index: usize, text: String },
    Comparison(ComparisonStatus),
    Judged(JudgeResult),
    Warning(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_addition() {
        let a = TokenUsage::new(10, 5, 15);
        let b = TokenUsage::new(1, 2, 3);
        assert_eq!(a + b, TokenUsage::new(11, 7, 18));
        assert_eq!(a + TokenUsage::default(), a);
        assert_eq!(a + b, b + a);

        let total: TokenUsage = vec![a, b, b].into_iter().sum();
        assert_eq!(total, TokenUsage::new(12, 9, 21));
    }

    #[test]
    fn test_token_usage_camel_case_wire_format() {
        let usage: TokenUsage =
            serde_json::from_str(r#"{"promptTokens": 3, "completionTokens": 4, "totalTokens": 7}"#)
                .unwrap();
        assert_eq!(usage, TokenUsage::new(3, 4, 7));

        let partial: TokenUsage = serde_json::from_str(r#"{"totalTokens": 9}"#).unwrap();
        assert_eq!(partial, TokenUsage::new(0, 0, 9));
    }

    #[test]
    fn test_slot_status_classification() {
        assert!(SlotStatus::Generating.is_in_flight());
        assert!(SlotStatus::Regenerating.is_in_flight());
        assert!(!SlotStatus::Idle.is_terminal());
        assert!(SlotStatus::Streamed.is_terminal());
        assert!(SlotStatus::Aborted.is_failed());
        assert!(
            SlotStatus::Errored {
                message: "boom".to_string()
            }
            .is_failed()
        );
        assert!(!SlotStatus::Streamed.is_failed());
    }

    #[test]
    fn test_slot_labels() {
        assert_eq!(slot_label(0), "A");
        assert_eq!(slot_label(1), "B");
        assert_eq!(slot_label(25), "Z");
        assert_eq!(slot_label(26), "27");
        assert_eq!(SlotKey::Model(1).to_string(), "model B");
    }

    #[test]
    fn test_tie_is_authoritative_over_totals() {
        let mut a = BTreeMap::new();
        a.insert("clarity".to_string(), 9.0);
        a.insert("accuracy".to_string(), 9.0);
        let mut b = BTreeMap::new();
        b.insert("clarity".to_string(), 4.0);
        b.insert("accuracy".to_string(), 5.0);

        let result = JudgeResult {
            slots: vec![
                SlotVerdict {
                    slot_index: 0,
                    scores: a,
                    reasoning: String::new(),
                },
                SlotVerdict {
                    slot_index: 1,
                    scores: b,
                    reasoning: String::new(),
                },
            ],
            winner_index: None,
            winner_reasoning: "Both are fine".to_string(),
        };

        assert_eq!(result.total_for(0), Some(18.0));
        assert_eq!(result.total_for(1), Some(9.0));
        assert!(result.is_tie());
        assert_eq!(result.winner_label(), "Tie");
    }

    #[test]
    fn test_winner_label_and_max_total() {
        let result = JudgeResult {
            slots: vec![],
            winner_index: Some(1),
            winner_reasoning: String::new(),
        };
        assert_eq!(result.winner_label(), "Model B Wins");
        assert_eq!(max_total(&ScoringCategory::defaults()), 50.0);
    }

    #[test]
    fn test_category_validity_and_clamp() {
        let category = ScoringCategory::new("clarity", "Clarity", "", 1.0, 5.0);
        assert!(category.is_valid());
        assert_eq!(category.clamp(7.0), 5.0);
        assert_eq!(category.clamp(0.0), 1.0);
        assert!(!ScoringCategory::new("x", "X", "", 3.0, 2.0).is_valid());
    }
}
