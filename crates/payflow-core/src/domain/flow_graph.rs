//! In-memory adjacency view of a flow definition
//!
//! Built once per definition version and treated as a value; never
//! mutated in place.

use crate::domain::flow_definition::{FlowDefinition, StepDefinition, StepType};
use crate::domain::ids::StepCode;
use crate::types::Payload;
use crate::EngineError;
use std::collections::HashMap;
use tracing::debug;

/// Default substring marking the failure-path step of a CONDITION fallback
const DEFAULT_FAILURE_MARKER: &str = "FAIL";

/// Resolves step succession for one flow definition
#[derive(Debug, Clone)]
pub struct FlowGraph {
    steps: HashMap<StepCode, StepDefinition>,
    /// Outgoing transition indices per step, pre-sorted by priority
    outgoing: HashMap<StepCode, Vec<usize>>,
    transitions: Vec<crate::domain::flow_definition::Transition>,
    /// Step codes ordered by `order_index`
    by_order: Vec<StepCode>,
}

impl FlowGraph {
    /// Build the graph from a validated definition
    pub fn build(definition: &FlowDefinition) -> Result<Self, EngineError> {
        definition.validate()?;

        let steps: HashMap<StepCode, StepDefinition> = definition
            .steps
            .iter()
            .map(|s| (s.code.clone(), s.clone()))
            .collect();

        let mut outgoing: HashMap<StepCode, Vec<usize>> = HashMap::new();
        for (index, transition) in definition.transitions.iter().enumerate() {
            outgoing
                .entry(transition.from.clone())
                .or_default()
                .push(index);
        }
        for indices in outgoing.values_mut() {
            indices.sort_by_key(|&i| definition.transitions[i].priority);
        }

        let mut by_order: Vec<StepCode> = definition.steps.iter().map(|s| s.code.clone()).collect();
        by_order.sort_by_key(|code| steps[code].order_index);

        Ok(Self {
            steps,
            outgoing,
            transitions: definition.transitions.clone(),
            by_order,
        })
    }

    /// Find a step by code
    pub fn step(&self, code: &StepCode) -> Option<&StepDefinition> {
        self.steps.get(code)
    }

    /// The flow's START step
    pub fn start_step(&self) -> Result<&StepDefinition, EngineError> {
        self.steps
            .values()
            .find(|s| s.step_type == StepType::Start)
            .ok_or_else(|| EngineError::ValidationError("Flow has no START step".to_string()))
    }

    /// Resolve the step following `current` given the working payload
    ///
    /// Explicit transitions win, in priority order, first passing condition
    /// taken. With no outgoing transitions, a CONDITION step falls back to
    /// its configured success/failure branch; any other step falls back to
    /// the next-higher order index. `None` means the flow is done.
    pub fn resolve_next(&self, current: &StepCode, payload: &Payload) -> Option<&StepDefinition> {
        let step = self.steps.get(current)?;

        if step.step_type == StepType::End {
            return None;
        }

        if let Some(indices) = self.outgoing.get(current) {
            for &index in indices {
                let transition = &self.transitions[index];
                let passes = transition
                    .condition
                    .as_ref()
                    .map(|c| c.evaluate(payload))
                    .unwrap_or(true);
                if passes {
                    return self.steps.get(&transition.to);
                }
            }
            // All outgoing transitions guarded and none passed
            debug!(step = %current, "No transition condition passed");
            return None;
        }

        if step.step_type == StepType::Condition {
            return self.resolve_condition_fallback(step, payload);
        }

        self.next_by_order(step)
    }

    /// CONDITION fallback: check the configured field against the success
    /// value-set and pick the success or failure branch by naming/order
    /// convention. A fallback of last resort; explicit transitions are the
    /// preferred way to branch.
    fn resolve_condition_fallback(
        &self,
        step: &StepDefinition,
        payload: &Payload,
    ) -> Option<&StepDefinition> {
        let field = step.config.condition_field.as_deref()?;
        let marker = step
            .config
            .failure_marker
            .as_deref()
            .unwrap_or(DEFAULT_FAILURE_MARKER);

        let success = payload
            .get_str(field)
            .map(|value| step.config.success_values.iter().any(|s| s == value))
            .unwrap_or(false);

        if success {
            // Success path: next step by order whose code is not the
            // failure branch
            self.by_order
                .iter()
                .filter(|code| self.steps[*code].order_index > step.order_index)
                .find(|code| !code.0.contains(marker))
                .map(|code| &self.steps[code])
        } else {
            self.by_order
                .iter()
                .find(|code| code.0.contains(marker))
                .map(|code| &self.steps[code])
        }
    }

    fn next_by_order(&self, step: &StepDefinition) -> Option<&StepDefinition> {
        self.by_order
            .iter()
            .map(|code| &self.steps[code])
            .filter(|s| s.order_index > step.order_index)
            .min_by_key(|s| s.order_index)
    }
}
