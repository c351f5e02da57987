//! Traffic shaper — weighted and sticky routing between deploy versions.
//!
//! Rules are kept sorted by weight descending. Selection walks the rules
//! accumulating weights and picks the first rule whose cumulative span
//! covers the drawn value: a stable rolling hash of the sticky key, or a
//! uniform random draw for anonymous callers.

use std::sync::RwLock;

use rand::Rng;
use tracing::info;

use avaast_core::{ResourceRef, TrafficRule};

use crate::error::XrpcError;

/// Total basis points a rule set must sum to.
pub const TOTAL_BP: u32 = 10_000;

/// Deterministic rolling hash of the sticky key, stable across restarts.
/// The same key always lands in the same weight span for a given rule set.
pub fn sticky_hash(key: &str) -> u32 {
    let mut hash: u32 = 0;
    for byte in key.bytes() {
        hash = hash.wrapping_mul(31).wrapping_add(byte as u32);
    }
    hash % TOTAL_BP
}

/// Weighted deploy selector.
#[derive(Default)]
pub struct TrafficShaper {
    rules: RwLock<Vec<TrafficRule>>,
}

impl TrafficShaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rule set. Non-empty sets must sum to exactly 10000
    /// basis points; rejected updates leave the previous rules in effect.
    /// An empty set clears routing entirely.
    pub fn update_rules(&self, rules: Vec<TrafficRule>) -> Result<(), XrpcError> {
        if !rules.is_empty() {
            let sum: u32 = rules.iter().map(|r| r.weight_bp).sum();
            if sum != TOTAL_BP {
                return Err(XrpcError::InvalidRequest(format!(
                    "traffic rule weights must sum to {TOTAL_BP}, got {sum}"
                )));
            }
        }
        let mut sorted = rules;
        sorted.sort_by(|a, b| b.weight_bp.cmp(&a.weight_bp));
        info!(count = sorted.len(), "traffic rules updated");
        *self.rules.write().expect("rules lock") = sorted;
        Ok(())
    }

    /// Pick a deploy for this request. `None` means no rules are in
    /// effect and the caller should report service unavailable.
    pub fn select_deploy(&self, sticky_key: Option<&str>) -> Option<ResourceRef> {
        let rules = self.rules.read().expect("rules lock");
        match rules.len() {
            0 => None,
            1 => Some(rules[0].deploy.clone()),
            _ => {
                let value = match sticky_key {
                    Some(key) => sticky_hash(key),
                    None => rand::rng().random_range(0..TOTAL_BP),
                };
                let mut cumulative = 0u32;
                for rule in rules.iter() {
                    cumulative += rule.weight_bp;
                    if value < cumulative {
                        return Some(rule.deploy.clone());
                    }
                }
                // Weights sum to TOTAL_BP, so the walk always lands.
                rules.last().map(|r| r.deploy.clone())
            }
        }
    }

    pub fn rules(&self) -> Vec<TrafficRule> {
        self.rules.read().expect("rules lock").clone()
    }
}
