//! Domain events: the process log of an instance's life
//!
//! Events are recorded on the aggregates as state changes happen and
//! drained to a `DomainEventHandler` after each persist.

use crate::domain::ids::{CallbackId, FlowId, InstanceId, ReversalId, StepCode, TsqId};
use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Domain event trait for all events in the system
pub trait DomainEvent: Debug + Send + Sync {
    /// Returns the type of the event as a string
    fn event_type(&self) -> &'static str;

    /// Returns the flow instance this event is associated with
    fn instance_id(&self) -> &InstanceId;

    /// Returns the timestamp when the event occurred
    fn timestamp(&self) -> DateTime<Utc>;
}

macro_rules! domain_event {
    ($(#[$doc:meta])* $name:ident, $event_type:literal, { $($(#[$fdoc:meta])* $field:ident: $ty:ty),* $(,)? }) => {
        $(#[$doc])*
        #[derive(Debug)]
        pub struct $name {
            /// The flow instance the event belongs to
            pub instance_id: InstanceId,
            $($(#[$fdoc])* pub $field: $ty,)*
            /// When the event occurred
            pub timestamp: DateTime<Utc>,
        }

        impl DomainEvent for $name {
            fn event_type(&self) -> &'static str {
                $event_type
            }

            fn instance_id(&self) -> &InstanceId {
                &self.instance_id
            }

            fn timestamp(&self) -> DateTime<Utc> {
                self.timestamp
            }
        }
    };
}

domain_event!(
    /// Event: Flow instance created
    InstanceCreated,
    "instance.created",
    {
        /// The flow definition the instance runs
        flow_id: FlowId,
    }
);

domain_event!(
    /// Event: Flow instance suspended awaiting an external callback
    InstanceSuspendedForCallback,
    "instance.suspended_for_callback",
    {
        /// The step that suspended
        step: StepCode,
    }
);

domain_event!(
    /// Event: Flow instance parked for operator intervention
    InstanceSuspendedForManual,
    "instance.suspended_for_manual",
    {
        /// The step that suspended
        step: StepCode,
        /// Operator-facing reason
        reason: String,
    }
);

domain_event!(
    /// Event: Flow instance resumed
    InstanceResumed,
    "instance.resumed",
    {}
);

domain_event!(
    /// Event: Flow instance completed
    InstanceCompleted,
    "instance.completed",
    {}
);

domain_event!(
    /// Event: Flow instance failed
    InstanceFailed,
    "instance.failed",
    {
        /// The error message
        error: String,
    }
);

domain_event!(
    /// Event: Flow instance cancelled
    InstanceCancelled,
    "instance.cancelled",
    {}
);

domain_event!(
    /// Event: Flow instance finalized by a concluded reversal
    InstanceReversed,
    "instance.reversed",
    {
        /// Whether the compensating transaction succeeded
        success: bool,
    }
);

domain_event!(
    /// Event: Step started execution
    StepStarted,
    "step.started",
    {
        /// The step that started
        step: StepCode,
        /// Attempt number, 1-based
        attempt: u32,
    }
);

domain_event!(
    /// Event: Step completed
    StepCompleted,
    "step.completed",
    {
        /// The step that completed
        step: StepCode,
    }
);

domain_event!(
    /// Event: Step failed
    StepFailed,
    "step.failed",
    {
        /// The step that failed
        step: StepCode,
        /// The error message
        error: String,
    }
);

domain_event!(
    /// Event: Waiting step timed out
    StepTimedOut,
    "step.timed_out",
    {
        /// The step whose callback deadline passed
        step: StepCode,
    }
);

domain_event!(
    /// Event: An inbound callback matched a waiting expectation
    CallbackMatched,
    "callback.matched",
    {
        /// The matched expectation
        callback_id: CallbackId,
    }
);

domain_event!(
    /// Event: A status query was scheduled for the instance
    TsqScheduled,
    "tsq.scheduled",
    {
        /// The status query request
        tsq_id: TsqId,
        /// Why the query was needed
        reason: String,
    }
);

domain_event!(
    /// Event: A compensating reversal was created for the instance
    ReversalCreated,
    "reversal.created",
    {
        /// The reversal request
        reversal_id: ReversalId,
    }
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let instance_id = InstanceId("inst-1".to_string());
        let timestamp = Utc::now();

        let event = InstanceCreated {
            instance_id: instance_id.clone(),
            flow_id: FlowId("flow-1".to_string()),
            timestamp,
        };

        assert_eq!(event.event_type(), "instance.created");
        assert_eq!(event.instance_id(), &instance_id);
        assert_eq!(event.timestamp(), timestamp);
    }

    #[test]
    fn test_step_failed_event() {
        let instance_id = InstanceId("inst-2".to_string());
        let event = StepFailed {
            instance_id: instance_id.clone(),
            step: StepCode("DEBIT".to_string()),
            error: "transport failed".to_string(),
            timestamp: Utc::now(),
        };

        assert_eq!(event.event_type(), "step.failed");
        assert_eq!(event.instance_id(), &instance_id);
    }

    #[test]
    fn test_events_are_boxable() {
        let events: Vec<Box<dyn DomainEvent>> = vec![
            Box::new(InstanceResumed {
                instance_id: InstanceId("i".to_string()),
                timestamp: Utc::now(),
            }),
            Box::new(TsqScheduled {
                instance_id: InstanceId("i".to_string()),
                tsq_id: TsqId("t".to_string()),
                reason: "callback timeout".to_string(),
                timestamp: Utc::now(),
            }),
        ];

        assert_eq!(events[0].event_type(), "instance.resumed");
        assert_eq!(events[1].event_type(), "tsq.scheduled");
    }
}
