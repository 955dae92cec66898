//! Token usage accounting shared by every slot of a session

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::models::{SlotKey, TokenUsage};

/// Per-slot totals plus the grand total, always mutated together
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageLedger {
    per_slot: BTreeMap<SlotKey, TokenUsage>,
    total: TokenUsage,
}

impl UsageLedger {
    pub fn slot(&self, key: SlotKey) -> TokenUsage {
        self.per_slot.get(&key).copied().unwrap_or_default()
    }

    pub fn total(&self) -> TokenUsage {
        self.total
    }

    pub fn entries(&self) -> impl Iterator<Item = (SlotKey, TokenUsage)> + '_ {
        self.per_slot.iter().map(|(k, v)| (*k, *v))
    }

    /// Grand total equals the componentwise sum of the slot totals
    pub fn is_consistent(&self) -> bool {
        self.per_slot.values().copied().sum::<TokenUsage>() == self.total
    }

    /// Flatten into the models/judge/total shape used for rendering
    pub fn summary(&self, model_count: usize) -> UsageSummary {
        let highest = self
            .per_slot
            .keys()
            .filter_map(|k| match k {
                SlotKey::Model(i) => Some(i + 1),
                SlotKey::Judge => None,
            })
            .max()
            .unwrap_or(0);

        UsageSummary {
            models: (0..model_count.max(highest))
                .map(|i| self.slot(SlotKey::Model(i)))
                .collect(),
            judge: self.slot(SlotKey::Judge),
            total: self.total,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub models: Vec<TokenUsage>,
    pub judge: TokenUsage,
    pub total: TokenUsage,
}

/// Accumulates usage per slot and a running grand total.
///
/// A single mutex guards both figures, so no reader can observe a slot total
/// without the matching grand total.
#[derive(Debug, Default)]
pub struct UsageAggregator {
    ledger: Mutex<UsageLedger>,
}

impl UsageAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, UsageLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: SlotKey, usage: TokenUsage) {
        let mut ledger = self.lock();
        *ledger.per_slot.entry(key).or_default() += usage;
        ledger.total += usage;
    }

    pub fn slot(&self, key: SlotKey) -> TokenUsage {
        self.lock().slot(key)
    }

    pub fn total(&self) -> TokenUsage {
        self.lock().total
    }

    pub fn snapshot(&self) -> UsageLedger {
        self.lock().clone()
    }

    /// Only called on a full comparison reset
    pub fn reset(&self) {
        *self.lock() = UsageLedger::default();
    }
}
