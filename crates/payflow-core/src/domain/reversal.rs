//! Compensating reversal requests
//!
//! When one leg of a multi-leg transfer succeeded and a later leg
//! definitively failed, a reversal undoes the succeeded leg by issuing a
//! swapped-leg compensating transaction.

use crate::domain::ids::{InstanceId, ReversalId};
use crate::types::Payload;
use crate::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The debit/credit field pairs exchanged when building a compensating
/// payload
const LEG_FIELD_PAIRS: [(&str, &str); 3] = [
    ("debit_account", "credit_account"),
    ("debit_account_name", "credit_account_name"),
    ("debit_bank_code", "credit_bank_code"),
];

/// Which leg the reversal compensates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReversalType {
    /// Undo the debit leg
    DebitReversal,
    /// Undo the credit leg
    CreditReversal,
    /// Undo the whole transfer
    Full,
}

impl ReversalType {
    /// Wire function code carried on the compensating request
    pub fn function_code(&self) -> &'static str {
        match self {
            ReversalType::DebitReversal => "REV_DR",
            ReversalType::CreditReversal => "REV_CR",
            ReversalType::Full => "REV",
        }
    }
}

/// Reversal request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReversalStatus {
    /// Created, not yet executed
    Pending,
    /// The compensating call is in flight or awaiting its callback
    InProgress,
    /// Terminal: compensation confirmed
    Success,
    /// Terminal: compensation failed
    Failed,
    /// Terminal: cancelled before execution
    Cancelled,
}

/// One compensating-transaction attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReversalRequest {
    /// Unique identifier
    pub id: ReversalId,

    /// The instance being compensated
    pub instance_id: InstanceId,

    /// Which leg is undone
    pub reversal_type: ReversalType,

    /// Why the reversal was raised
    pub reason: String,

    /// The swapped-leg compensating payload
    pub payload: Payload,

    /// Current status
    pub status: ReversalStatus,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl ReversalRequest {
    /// Build a compensating request from the original payload
    pub fn compensating(
        instance_id: InstanceId,
        original: &Payload,
        reversal_type: ReversalType,
        reason: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ReversalId::generate(),
            instance_id,
            reversal_type,
            reason,
            payload: build_reversal_payload(original, reversal_type),
            status: ReversalStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Begin executing the compensating call; guarded to PENDING
    pub fn begin(&mut self) -> Result<(), EngineError> {
        if self.status != ReversalStatus::Pending {
            return Err(EngineError::ReversalError(format!(
                "Cannot execute reversal {} in state {:?}",
                self.id, self.status
            )));
        }
        self.status = ReversalStatus::InProgress;
        self.touch();
        Ok(())
    }

    /// Return the request to PENDING after a transport failure so a retry
    /// can pick it up
    pub fn reset_to_pending(&mut self) {
        self.status = ReversalStatus::Pending;
        self.touch();
    }

    /// Finalize with the compensation outcome
    pub fn finalize(&mut self, success: bool) {
        self.status = if success {
            ReversalStatus::Success
        } else {
            ReversalStatus::Failed
        };
        self.touch();
    }

    /// Cancel; only permitted while PENDING
    pub fn cancel(&mut self) -> Result<(), EngineError> {
        if self.status != ReversalStatus::Pending {
            return Err(EngineError::ReversalError(format!(
                "Cannot cancel reversal {} in state {:?}",
                self.id, self.status
            )));
        }
        self.status = ReversalStatus::Cancelled;
        self.touch();
        Ok(())
    }
}

/// Build the swapped-leg compensating payload: debit and credit
/// account/name/bank fields exchanged, with the reversal function code
/// stamped on
pub fn build_reversal_payload(original: &Payload, reversal_type: ReversalType) -> Payload {
    let mut compensating = original.clone();

    for (debit_field, credit_field) in LEG_FIELD_PAIRS {
        let debit = original.get_path(debit_field).cloned();
        let credit = original.get_path(credit_field).cloned();

        match credit {
            Some(value) => compensating.set_path(debit_field, value),
            None => {
                compensating.remove_path(debit_field);
            }
        }
        match debit {
            Some(value) => compensating.set_path(credit_field, value),
            None => {
                compensating.remove_path(credit_field);
            }
        }
    }

    compensating.set_path(
        "function_code",
        Value::String(reversal_type.function_code().to_string()),
    );
    compensating
}
