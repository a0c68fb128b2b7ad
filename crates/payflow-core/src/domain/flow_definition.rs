use crate::domain::condition::Condition;
use crate::domain::ids::{FlowId, StepCode};
use crate::EngineError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A parsed and activated flow definition
///
/// Immutable once activated; a new version supersedes rather than mutates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    /// ID of the flow
    pub id: FlowId,

    /// External flow code used by callers to start instances
    pub code: String,

    /// Version of this definition; higher versions supersede lower ones
    pub version: u32,

    /// Human-readable name of the flow
    pub name: String,

    /// Description of the flow
    pub description: Option<String>,

    /// Whether instances execute inline and return the final payload
    pub synchronous: bool,

    /// The steps in this flow, ordered by `order_index`
    pub steps: Vec<StepDefinition>,

    /// Directed transitions between steps
    pub transitions: Vec<Transition>,
}

/// The closed set of step types the engine executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    /// Entry marker, identity pass-through
    Start,
    /// Exit marker, identity pass-through
    End,
    /// Field-mapping payload transformation
    Transform,
    /// Outbound call to an external system
    ApiCall,
    /// Waits for an inbound external callback without calling out
    Callback,
    /// Branch point; routing is the flow graph's responsibility
    Condition,
    /// Small built-in action (log, delay, validate)
    Task,
    /// Parks the instance for operator intervention
    Manual,
    /// Fires a notification side-effect
    Alert,
}

/// One step in a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step code, unique within the flow
    pub code: StepCode,

    /// Human-readable name
    pub name: String,

    /// Step type
    pub step_type: StepType,

    /// Position in the flow; the order fallback picks the next-higher index
    pub order_index: u32,

    /// Type-specific configuration
    #[serde(default)]
    pub config: StepConfig,

    /// Retry policy applied by the coordinator
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// Type-specific step configuration
///
/// A single bag of optional sections; which sections matter depends on the
/// step type. Validation rejects steps missing their required sections.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StepConfig {
    /// Field mappings (TRANSFORM payload rewrite, API_CALL body projection)
    #[serde(default)]
    pub mappings: Vec<FieldMapping>,

    /// Imperative transform operations applied after the mappings
    #[serde(default)]
    pub ops: Vec<TransformOp>,

    /// Target endpoint for API_CALL
    pub endpoint: Option<String>,

    /// HTTP method for API_CALL; defaults to POST
    pub method: Option<String>,

    /// Request timeout for the outbound call, seconds
    pub request_timeout_secs: Option<u64>,

    /// Whether the API_CALL awaits an asynchronous callback
    #[serde(default)]
    pub await_callback: bool,

    /// Callback deadline for suspend-for-callback steps, seconds
    pub callback_timeout_secs: Option<u64>,

    /// Which leg of a multi-leg transfer this call is (1-based)
    pub leg: Option<u32>,

    /// CONDITION fallback: payload field holding the branch outcome
    pub condition_field: Option<String>,

    /// CONDITION fallback: values of `condition_field` counted as success
    #[serde(default)]
    pub success_values: Vec<String>,

    /// CONDITION fallback: substring marking the failure-path step code
    pub failure_marker: Option<String>,

    /// MANUAL reason or ALERT message
    pub reason: Option<String>,

    /// TASK sub-type
    pub task: Option<TaskKind>,
}

/// Built-in TASK actions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Log a message at info level
    Log {
        /// Message to log
        message: String,
    },
    /// Pause execution for a fixed duration
    Delay {
        /// Milliseconds to sleep
        millis: u64,
    },
    /// Require a set of payload fields to be present
    Validate {
        /// Dot-paths that must resolve to non-null values
        required: Vec<String>,
    },
}

/// One field mapping: read `source`, optionally transform, write `target`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Dot-path into the input payload
    pub source: String,

    /// Dot-path into the output payload
    pub target: String,

    /// Optional transform function applied to the value
    #[serde(default)]
    pub transform: Option<TransformFn>,

    /// Default used when the source path does not resolve
    #[serde(default)]
    pub default: Option<Value>,
}

/// The closed set of mapping transform functions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum TransformFn {
    Uppercase,
    Lowercase,
    Trim,
    PadLeft { width: usize, fill: char },
    PadRight { width: usize, fill: char },
    Substring { start: usize, len: usize },
    RegexReplace { pattern: String, replacement: String },
    NumericFormat { scale: u32 },
    DateFormat { from: String, to: String },
    Constant { value: Value },
}

/// Imperative transform operations, applied in order after the mappings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOp {
    /// Write a literal value
    Set { path: String, value: Value },
    /// Copy one path to another
    Copy { from: String, to: String },
    /// Remove a path
    Delete { path: String },
    /// Copy with a transform function applied
    Derive {
        from: String,
        to: String,
        transform: TransformFn,
    },
}

/// Per-step retry policy, enforced by the coordinator
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts including the first
    pub max_attempts: u32,

    /// Sleep between attempts, milliseconds
    pub retry_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            retry_interval_ms: 0,
        }
    }
}

/// A directed edge between two steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transition {
    /// Source step code
    pub from: StepCode,

    /// Target step code
    pub to: StepCode,

    /// Evaluation order; lower priorities are evaluated first
    #[serde(default)]
    pub priority: u32,

    /// Optional guard; a missing condition always passes
    #[serde(default)]
    pub condition: Option<Condition>,
}

impl FlowDefinition {
    /// Find a step by its code
    pub fn step(&self, code: &StepCode) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| &s.code == code)
    }

    /// Validate the flow definition at activation time
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.steps.is_empty() {
            return Err(EngineError::ValidationError(
                "Flow must have at least one step".to_string(),
            ));
        }

        // Check for step code uniqueness
        let mut step_codes = std::collections::HashSet::new();
        for step in &self.steps {
            if !step_codes.insert(step.code.0.as_str()) {
                return Err(EngineError::ValidationError(format!(
                    "Duplicate step code: {}",
                    step.code.0
                )));
            }
        }

        // Check for exactly one START step
        let starts = self
            .steps
            .iter()
            .filter(|s| s.step_type == StepType::Start)
            .count();
        if starts != 1 {
            return Err(EngineError::ValidationError(format!(
                "Flow must have exactly one START step, found {}",
                starts
            )));
        }

        // Check transition endpoints
        for transition in &self.transitions {
            for code in [&transition.from, &transition.to] {
                if !step_codes.contains(code.0.as_str()) {
                    return Err(EngineError::ValidationError(format!(
                        "Transition references non-existent step: {}",
                        code.0
                    )));
                }
            }
        }

        // Per-type required configuration
        for step in &self.steps {
            match step.step_type {
                StepType::ApiCall if step.config.endpoint.is_none() => {
                    return Err(EngineError::ValidationError(format!(
                        "API_CALL step {} has no endpoint configured",
                        step.code.0
                    )));
                }
                StepType::Task if step.config.task.is_none() => {
                    return Err(EngineError::ValidationError(format!(
                        "TASK step {} has no task configured",
                        step.code.0
                    )));
                }
                _ => {}
            }
        }

        // Check for cycles over explicit transitions
        self.check_for_cycles()?;

        Ok(())
    }

    /// Check for cycles in the transition graph
    fn check_for_cycles(&self) -> Result<(), EngineError> {
        let mut visited = std::collections::HashSet::new();
        let mut rec_stack = std::collections::HashSet::new();

        // Map of step code to outgoing targets for easier lookup
        let mut edge_map: std::collections::HashMap<&str, Vec<&str>> =
            std::collections::HashMap::new();
        for transition in &self.transitions {
            edge_map
                .entry(transition.from.0.as_str())
                .or_default()
                .push(transition.to.0.as_str());
        }

        // DFS for cycle detection
        for step in &self.steps {
            if self.is_cyclic(step.code.0.as_str(), &edge_map, &mut visited, &mut rec_stack) {
                return Err(EngineError::ValidationError(format!(
                    "Cycle detected in transitions involving step: {}",
                    step.code.0
                )));
            }
        }

        Ok(())
    }

    fn is_cyclic<'a>(
        &self,
        step_code: &'a str,
        edge_map: &std::collections::HashMap<&'a str, Vec<&'a str>>,
        visited: &mut std::collections::HashSet<&'a str>,
        rec_stack: &mut std::collections::HashSet<&'a str>,
    ) -> bool {
        if !visited.contains(step_code) {
            visited.insert(step_code);
            rec_stack.insert(step_code);

            if let Some(targets) = edge_map.get(step_code) {
                for target in targets {
                    if (!visited.contains(target)
                        && self.is_cyclic(target, edge_map, visited, rec_stack))
                        || rec_stack.contains(target)
                    {
                        return true;
                    }
                }
            }
        }

        rec_stack.remove(step_code);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(code: &str, step_type: StepType, order: u32) -> StepDefinition {
        let mut config = StepConfig::default();
        if step_type == StepType::ApiCall {
            config.endpoint = Some("https://transfer.example/api".to_string());
        }
        StepDefinition {
            code: StepCode(code.to_string()),
            name: code.to_string(),
            step_type,
            order_index: order,
            config,
            retry: RetryPolicy::default(),
        }
    }

    fn transition(from: &str, to: &str) -> Transition {
        Transition {
            from: StepCode(from.to_string()),
            to: StepCode(to.to_string()),
            priority: 0,
            condition: None,
        }
    }

    fn definition(steps: Vec<StepDefinition>, transitions: Vec<Transition>) -> FlowDefinition {
        FlowDefinition {
            id: FlowId("flow-1".to_string()),
            code: "NIP_TRANSFER".to_string(),
            version: 1,
            name: "Transfer".to_string(),
            description: None,
            synchronous: false,
            steps,
            transitions,
        }
    }

    #[test]
    fn test_validate_ok() {
        let def = definition(
            vec![
                step("START", StepType::Start, 0),
                step("DEBIT", StepType::ApiCall, 1),
                step("END", StepType::End, 2),
            ],
            vec![transition("START", "DEBIT"), transition("DEBIT", "END")],
        );

        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_steps() {
        let def = definition(vec![], vec![]);
        let result = def.validate();

        match result {
            Err(EngineError::ValidationError(msg)) => {
                assert!(msg.contains("at least one step"));
            }
            _ => panic!("Expected ValidationError"),
        }
    }

    #[test]
    fn test_validate_duplicate_step_codes() {
        let def = definition(
            vec![
                step("START", StepType::Start, 0),
                step("START", StepType::Transform, 1),
            ],
            vec![],
        );

        match def.validate() {
            Err(EngineError::ValidationError(msg)) => {
                assert!(msg.contains("Duplicate step code"));
            }
            _ => panic!("Expected ValidationError"),
        }
    }

    #[test]
    fn test_validate_missing_start() {
        let def = definition(vec![step("T1", StepType::Transform, 0)], vec![]);

        match def.validate() {
            Err(EngineError::ValidationError(msg)) => {
                assert!(msg.contains("exactly one START"));
            }
            _ => panic!("Expected ValidationError"),
        }
    }

    #[test]
    fn test_validate_dangling_transition() {
        let def = definition(
            vec![step("START", StepType::Start, 0)],
            vec![transition("START", "MISSING")],
        );

        match def.validate() {
            Err(EngineError::ValidationError(msg)) => {
                assert!(msg.contains("non-existent step"));
                assert!(msg.contains("MISSING"));
            }
            _ => panic!("Expected ValidationError"),
        }
    }

    #[test]
    fn test_validate_api_call_without_endpoint() {
        let mut bad = step("CALL", StepType::ApiCall, 1);
        bad.config.endpoint = None;

        let def = definition(vec![step("START", StepType::Start, 0), bad], vec![]);

        match def.validate() {
            Err(EngineError::ValidationError(msg)) => {
                assert!(msg.contains("no endpoint"));
            }
            _ => panic!("Expected ValidationError"),
        }
    }

    #[test]
    fn test_validate_cyclic_transitions() {
        let def = definition(
            vec![
                step("START", StepType::Start, 0),
                step("A", StepType::Transform, 1),
                step("B", StepType::Transform, 2),
            ],
            vec![
                transition("START", "A"),
                transition("A", "B"),
                transition("B", "A"),
            ],
        );

        match def.validate() {
            Err(EngineError::ValidationError(msg)) => {
                assert!(msg.contains("Cycle detected"));
            }
            _ => panic!("Expected ValidationError"),
        }
    }

    #[test]
    fn test_step_lookup() {
        let def = definition(
            vec![
                step("START", StepType::Start, 0),
                step("X", StepType::Transform, 1),
            ],
            vec![],
        );

        assert!(def.step(&StepCode("X".to_string())).is_some());
        assert!(def.step(&StepCode("Y".to_string())).is_none());
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.retry_interval_ms, 0);
    }

    #[test]
    fn test_step_type_serialization() {
        let serialized = serde_json::to_string(&StepType::ApiCall).unwrap();
        assert_eq!(serialized, "\"API_CALL\"");

        let deserialized: StepType = serde_json::from_str("\"CALLBACK\"").unwrap();
        assert_eq!(deserialized, StepType::Callback);
    }
}
