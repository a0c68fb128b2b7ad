//! Value objects: identifiers used across the engine

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a new random identifier
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Value object: Flow definition ID
    FlowId
);
string_id!(
    /// Value object: Flow instance ID
    InstanceId
);
string_id!(
    /// Value object: Step execution ID
    StepExecutionId
);
string_id!(
    /// Value object: Job ID
    JobId
);
string_id!(
    /// Value object: Expected/received callback ID
    CallbackId
);
string_id!(
    /// Value object: TSQ request ID
    TsqId
);
string_id!(
    /// Value object: Reversal request ID
    ReversalId
);

/// Value object: step code, unique within one flow definition
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepCode(pub String);

impl fmt::Display for StepCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_unique() {
        assert_ne!(InstanceId::generate(), InstanceId::generate());
    }

    #[test]
    fn test_display() {
        let id = FlowId("flow-7".to_string());
        assert_eq!(id.to_string(), "flow-7");
        assert_eq!(StepCode("DEBIT".to_string()).to_string(), "DEBIT");
    }

    #[test]
    fn test_serde_round_trip() {
        let id = JobId("job-42".to_string());
        let serialized = serde_json::to_string(&id).unwrap();
        let deserialized: JobId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(id, deserialized);
    }
}
