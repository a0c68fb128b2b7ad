//! Response-code classification rules
//!
//! External systems answer with an `(action_code, approval_code)` pair.
//! These rules decide which codes are definite, which are indeterminate
//! and must escalate to a status query, and how a status-query response
//! classifies.

use serde::{Deserialize, Serialize};

/// Classification rules for transfer responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionCodeRules {
    /// Definite success
    #[serde(default = "default_success")]
    pub success: String,

    /// Definite, final failure; the one system-family code that is not
    /// indeterminate
    #[serde(default = "default_hard_failure")]
    pub hard_failure: String,

    /// Codes that always escalate to TSQ (system error, timeout,
    /// ambiguous outcome)
    #[serde(default = "default_indeterminate")]
    pub indeterminate: Vec<String>,

    /// Prefix of the "system" code family; any such code except
    /// `hard_failure` escalates to TSQ
    #[serde(default = "default_system_prefix")]
    pub system_prefix: String,
}

fn default_success() -> String {
    "000".to_string()
}

fn default_hard_failure() -> String {
    "999".to_string()
}

fn default_indeterminate() -> Vec<String> {
    vec!["909".to_string(), "912".to_string(), "06".to_string()]
}

fn default_system_prefix() -> String {
    "9".to_string()
}

impl Default for ActionCodeRules {
    fn default() -> Self {
        Self {
            success: default_success(),
            hard_failure: default_hard_failure(),
            indeterminate: default_indeterminate(),
            system_prefix: default_system_prefix(),
        }
    }
}

impl ActionCodeRules {
    /// Definite success
    pub fn is_success(&self, code: &str) -> bool {
        code == self.success
    }

    /// Definite, final failure
    pub fn is_hard_failure(&self, code: &str) -> bool {
        code == self.hard_failure
    }

    /// Whether a response code (or its absence) must escalate to a
    /// status query rather than resolve the instance directly
    pub fn needs_tsq(&self, code: Option<&str>) -> bool {
        let Some(code) = code else {
            // A missing action code is itself indeterminate
            return true;
        };

        if self.indeterminate.iter().any(|c| c == code) {
            return true;
        }

        code.starts_with(&self.system_prefix) && !self.is_hard_failure(code)
    }
}

/// How a status-query response classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TsqClass {
    /// The transaction definitely succeeded
    Success,
    /// The external system does not know the transaction
    NotFound,
    /// The query itself was rejected as malformed
    ValidationError,
    /// The transaction is still in flight
    StillPending,
    /// Anything else is a definite failure
    Other,
}

/// Classification rules for TSQ responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsqRules {
    /// Definite success
    #[serde(default = "default_success")]
    pub success: String,

    /// Transaction unknown to the external system
    #[serde(default = "default_not_found")]
    pub not_found: String,

    /// The query was rejected as malformed
    #[serde(default = "default_validation_error")]
    pub validation_error: String,

    /// The transaction is still being processed
    #[serde(default = "default_still_pending")]
    pub still_pending: Vec<String>,
}

fn default_not_found() -> String {
    "114".to_string()
}

fn default_validation_error() -> String {
    "115".to_string()
}

fn default_still_pending() -> Vec<String> {
    vec!["001".to_string(), "009".to_string()]
}

impl Default for TsqRules {
    fn default() -> Self {
        Self {
            success: default_success(),
            not_found: default_not_found(),
            validation_error: default_validation_error(),
            still_pending: default_still_pending(),
        }
    }
}

impl TsqRules {
    /// Classify a status-query response by its action code
    pub fn classify(&self, action_code: Option<&str>) -> TsqClass {
        match action_code {
            None => TsqClass::StillPending,
            Some(code) if code == self.success => TsqClass::Success,
            Some(code) if code == self.not_found => TsqClass::NotFound,
            Some(code) if code == self.validation_error => TsqClass::ValidationError,
            Some(code) if self.still_pending.iter().any(|c| c == code) => TsqClass::StillPending,
            Some(_) => TsqClass::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_tsq_trigger_set() {
        let rules = ActionCodeRules::default();

        // Missing code is indeterminate
        assert!(rules.needs_tsq(None));
        // Explicit indeterminate set
        assert!(rules.needs_tsq(Some("909")));
        assert!(rules.needs_tsq(Some("06")));
        // Wildcard system family
        assert!(rules.needs_tsq(Some("901")));
        assert!(rules.needs_tsq(Some("998")));
        // ...except the known hard failure
        assert!(!rules.needs_tsq(Some("999")));
        // Definite outcomes never escalate
        assert!(!rules.needs_tsq(Some("000")));
        assert!(!rules.needs_tsq(Some("057")));
    }

    #[test]
    fn test_success_and_failure() {
        let rules = ActionCodeRules::default();
        assert!(rules.is_success("000"));
        assert!(!rules.is_success("001"));
        assert!(rules.is_hard_failure("999"));
    }

    #[test]
    fn test_tsq_classification() {
        let rules = TsqRules::default();

        assert_eq!(rules.classify(Some("000")), TsqClass::Success);
        assert_eq!(rules.classify(Some("114")), TsqClass::NotFound);
        assert_eq!(rules.classify(Some("115")), TsqClass::ValidationError);
        assert_eq!(rules.classify(Some("001")), TsqClass::StillPending);
        assert_eq!(rules.classify(Some("009")), TsqClass::StillPending);
        assert_eq!(rules.classify(None), TsqClass::StillPending);
        assert_eq!(rules.classify(Some("057")), TsqClass::Other);
    }
}
