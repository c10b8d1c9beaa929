//! Allocation engine contract
//!
//! The numeric valuation → budget split lives behind this trait. The
//! orchestrator never looks inside it: it builds [`AllocationInputs`], hands
//! them over, and gets a [`BudgetAllocation`] back.

use std::fmt;

use super::types::{AllocationInputs, BudgetAllocation, NodeAllocation};

#[derive(Debug)]
pub enum EngineError {
    /// Inputs the engine cannot allocate from (e.g. no budget resolved).
    InvalidInputs(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidInputs(what) => write!(f, "invalid engine inputs: {}", what),
        }
    }
}

impl std::error::Error for EngineError {}

pub trait AllocationEngine: Send + Sync {
    /// Produce the budget split for one period.
    fn get_budget_allocations(
        &self,
        inputs: &AllocationInputs,
        is_initial: bool,
    ) -> Result<BudgetAllocation, EngineError>;

    /// Return a copy of `allocation` with the export count bumped for each
    /// node whose allocation id was actually delivered downstream.
    fn increment_export_counts(
        &self,
        allocation: &BudgetAllocation,
        allocation_ids: &[String],
    ) -> BudgetAllocation {
        let mut updated = allocation.clone();
        for node in updated.node_results.values_mut() {
            if allocation_ids.contains(&node.allocation_id) {
                node.export_count += 1;
            }
        }
        updated
    }
}

/// Reference engine: splits the remaining budget across nodes in proportion
/// to valuation. Production deployments substitute their own engine; this
/// one keeps the cycle runnable end to end.
pub struct ValuationProportionalEngine;

impl AllocationEngine for ValuationProportionalEngine {
    fn get_budget_allocations(
        &self,
        inputs: &AllocationInputs,
        is_initial: bool,
    ) -> Result<BudgetAllocation, EngineError> {
        let budget = match inputs.remaining_budget {
            Some(budget) => budget,
            None if is_initial => 0.0,
            None => {
                return Err(EngineError::InvalidInputs(format!(
                    "no remaining budget for campaign {}",
                    inputs.campaign_id
                )))
            }
        };

        let total_valuation: f64 = inputs.nodes.values().map(|n| n.valuation.max(0.0)).sum();

        let mut allocation = BudgetAllocation {
            period_start: Some(inputs.period_start),
            period_duration_hours: inputs.period_duration_hours,
            remaining_budget: inputs.remaining_budget,
            ..Default::default()
        };
        for (node, node_inputs) in &inputs.nodes {
            let share = if total_valuation > 0.0 {
                budget * node_inputs.valuation.max(0.0) / total_valuation
            } else {
                0.0
            };
            let mut result = NodeAllocation::new(String::new());
            result.valuation = node_inputs.valuation;
            result.export_budget = share;
            result.export_count = node_inputs.export_count;
            result.effective_impressions = node_inputs.effective_impressions;
            allocation.node_results.insert(node.clone(), result);
        }

        Ok(allocation)
    }
}
