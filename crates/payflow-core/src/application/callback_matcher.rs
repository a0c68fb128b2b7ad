//! The callback-matching subsystem
//!
//! Correlates inbound external notifications to waiting expectations:
//! every notification is stored (audit trail), the oldest PENDING
//! expectation with equal correlation fields wins, unmatched callbacks
//! are retried against later expectations, and a periodic sweep times
//! out expectations whose deadline passed and escalates their instances
//! to a status query.

use crate::application::coordinator::ExecutionCoordinator;
use crate::application::ports::DomainEventHandler;
use crate::application::reversal_controller::ReversalController;
use crate::application::rules::ActionCodeRules;
use crate::domain::callback::{CorrelationKey, ReceivedCallback};
use crate::domain::events::{CallbackMatched, StepTimedOut};
use crate::domain::ids::{CallbackId, InstanceId};
use crate::domain::repository::{
    CallbackRepository, ReversalRepository, StepExecutionRepository,
};
use crate::domain::reversal::ReversalStatus;
use crate::types::Payload;
use crate::EngineError;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What ingesting a callback produced
#[derive(Debug, PartialEq, Eq)]
pub enum MatchOutcome {
    /// Matched an expectation and resumed the instance
    Resumed { instance_id: InstanceId },

    /// Matched an expectation but the code was indeterminate; escalated
    /// to a status query instead of resuming
    Escalated { instance_id: InstanceId },

    /// Matched the wait of an in-flight reversal and concluded it
    ReversalConcluded { instance_id: InstanceId },

    /// No expectation matched; stored for the retry pass
    Unmatched { callback_id: CallbackId },
}

/// Correlates inbound callbacks to waiting steps
pub struct CallbackMatcher {
    callbacks: Arc<dyn CallbackRepository>,
    executions: Arc<dyn StepExecutionRepository>,
    reversals: Arc<dyn ReversalRepository>,
    coordinator: Arc<ExecutionCoordinator>,
    reversal_controller: Arc<ReversalController>,
    events: Arc<dyn DomainEventHandler>,
    rules: ActionCodeRules,
}

impl CallbackMatcher {
    /// Create a new matcher
    pub fn new(
        callbacks: Arc<dyn CallbackRepository>,
        executions: Arc<dyn StepExecutionRepository>,
        reversals: Arc<dyn ReversalRepository>,
        coordinator: Arc<ExecutionCoordinator>,
        reversal_controller: Arc<ReversalController>,
        events: Arc<dyn DomainEventHandler>,
        rules: ActionCodeRules,
    ) -> Self {
        Self {
            callbacks,
            executions,
            reversals,
            coordinator,
            reversal_controller,
            events,
            rules,
        }
    }

    /// Ingest an inbound external callback
    ///
    /// The callback is stored unconditionally, even when nothing
    /// matches: unmatched notifications are the audit trail and feed
    /// the retry pass.
    pub async fn ingest(
        &self,
        key: CorrelationKey,
        payload: Payload,
    ) -> Result<MatchOutcome, EngineError> {
        let received = ReceivedCallback::new(key, payload);
        self.callbacks.save_received(&received).await?;

        debug!(
            callback_id = %received.id,
            session_id = %received.key.session_id,
            "Callback received"
        );

        self.attempt_match(received).await
    }

    /// Re-attempt matching for callbacks that arrived before their
    /// expectation existed
    pub async fn retry_unmatched(&self) -> Result<usize, EngineError> {
        let mut matched = 0;
        for received in self.callbacks.unprocessed_received().await? {
            let outcome = self.attempt_match(received).await?;
            if !matches!(outcome, MatchOutcome::Unmatched { .. }) {
                matched += 1;
            }
        }
        Ok(matched)
    }

    /// Mark expired PENDING expectations TIMEOUT, time out their step
    /// executions, and escalate the owning instances to a status query;
    /// returns the number timed out
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let expired = self.callbacks.expired_pending(now).await?;
        let count = expired.len();

        for mut expectation in expired {
            expectation.mark_timeout()?;
            self.callbacks.save_expected(&expectation).await?;

            if let Some(mut execution) = self
                .executions
                .find_by_id(&expectation.step_execution_id)
                .await?
            {
                execution.timeout()?;
                self.executions.save(&execution).await?;

                self.events
                    .handle(Box::new(StepTimedOut {
                        instance_id: expectation.instance_id.clone(),
                        step: execution.step_code.clone(),
                        timestamp: Utc::now(),
                    }))
                    .await?;
            }

            warn!(
                instance_id = %expectation.instance_id,
                callback_id = %expectation.id,
                deadline = %expectation.deadline,
                "Expected callback timed out, escalating to status query"
            );

            self.coordinator
                .escalate_tsq(&expectation.instance_id, "callback timeout")
                .await?;
        }

        Ok(count)
    }

    async fn attempt_match(
        &self,
        mut received: ReceivedCallback,
    ) -> Result<MatchOutcome, EngineError> {
        if received.processed {
            // Replays of an already-matched callback never re-resume
            return Ok(MatchOutcome::Unmatched {
                callback_id: received.id,
            });
        }

        let Some(mut expectation) = self
            .callbacks
            .oldest_pending_for_key(&received.key)
            .await?
        else {
            debug!(callback_id = %received.id, "No pending expectation for callback");
            return Ok(MatchOutcome::Unmatched {
                callback_id: received.id,
            });
        };

        expectation.mark_matched()?;
        self.callbacks.save_expected(&expectation).await?;

        received.mark_processed(expectation.id.clone());
        self.callbacks.save_received(&received).await?;

        if let Some(mut execution) = self
            .executions
            .find_by_id(&expectation.step_execution_id)
            .await?
        {
            execution.complete(received.payload.clone());
            self.executions.save(&execution).await?;
        }

        self.events
            .handle(Box::new(CallbackMatched {
                instance_id: expectation.instance_id.clone(),
                callback_id: expectation.id.clone(),
                timestamp: Utc::now(),
            }))
            .await?;

        info!(
            instance_id = %expectation.instance_id,
            callback_id = %received.id,
            "Callback matched"
        );

        // An in-flight reversal owns this wait; its conclusion
        // finalizes the instance, not the flow loop
        let in_flight_reversal = self
            .reversals
            .find_by_instance(&expectation.instance_id)
            .await?
            .into_iter()
            .find(|r| r.status == ReversalStatus::InProgress);
        if let Some(reversal) = in_flight_reversal {
            self.reversal_controller
                .conclude_from_callback(&reversal.id, &received.payload)
                .await?;
            return Ok(MatchOutcome::ReversalConcluded {
                instance_id: expectation.instance_id,
            });
        }

        let action_code = received.payload.get_str("action_code");
        if self.rules.needs_tsq(action_code) {
            // An indeterminate notification resolves nothing; the
            // status query is the authority
            self.coordinator
                .escalate_tsq(&expectation.instance_id, "indeterminate callback code")
                .await?;
            return Ok(MatchOutcome::Escalated {
                instance_id: expectation.instance_id,
            });
        }

        self.coordinator
            .resume(&expectation.instance_id, &received.payload)
            .await?;

        Ok(MatchOutcome::Resumed {
            instance_id: expectation.instance_id,
        })
    }
}
