//! Repository traits for the Payflow engine
//!
//! The engine coordinates exclusively through these contracts; external
//! crates implement them for real persistence. Two of them carry the
//! engine's concurrency contracts and must be atomic in any
//! implementation: `JobRepository::claim` (no job leased twice) and
//! `CallbackRepository::save_expected` (at most one PENDING expectation
//! per instance).

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use super::callback::{CorrelationKey, ExpectedCallback, ExpectedCallbackStatus, ReceivedCallback};
use super::flow_definition::FlowDefinition;
use super::flow_instance::{FlowInstance, InstanceStatus};
use super::ids::{CallbackId, FlowId, InstanceId, JobId, ReversalId, StepExecutionId, TsqId};
use super::job::Job;
use super::reversal::ReversalRequest;
use super::step_execution::StepExecution;
use super::tsq::TsqRequest;
use crate::EngineError;

/// Repository for flow definitions
#[async_trait]
pub trait FlowDefinitionRepository: Send + Sync {
    /// Find a definition by ID
    async fn find_by_id(&self, id: &FlowId) -> Result<Option<FlowDefinition>, EngineError>;

    /// Find the highest activated version for a flow code
    async fn find_by_code(&self, code: &str) -> Result<Option<FlowDefinition>, EngineError>;

    /// Activate a definition
    async fn save(&self, definition: &FlowDefinition) -> Result<(), EngineError>;
}

/// Repository for flow instances
#[async_trait]
pub trait FlowInstanceRepository: Send + Sync {
    /// Find an instance by ID
    async fn find_by_id(&self, id: &InstanceId) -> Result<Option<FlowInstance>, EngineError>;

    /// Find the instance owning a correlation key
    async fn find_by_key(&self, key: &CorrelationKey)
        -> Result<Option<FlowInstance>, EngineError>;

    /// Save an instance
    async fn save(&self, instance: &FlowInstance) -> Result<(), EngineError>;

    /// List instances in a given status
    async fn list_by_status(
        &self,
        status: InstanceStatus,
    ) -> Result<Vec<FlowInstance>, EngineError>;
}

/// Repository for step executions
#[async_trait]
pub trait StepExecutionRepository: Send + Sync {
    /// Find an execution by ID
    async fn find_by_id(&self, id: &StepExecutionId)
        -> Result<Option<StepExecution>, EngineError>;

    /// Save an execution record
    async fn save(&self, execution: &StepExecution) -> Result<(), EngineError>;

    /// The instance's non-terminal execution, if one exists
    async fn find_open_for_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Option<StepExecution>, EngineError>;
}

/// Repository for expected and received callbacks
#[async_trait]
pub trait CallbackRepository: Send + Sync {
    /// Persist an expectation, enforcing the one-PENDING-per-instance
    /// invariant for new records
    async fn save_expected(&self, expected: &ExpectedCallback) -> Result<(), EngineError>;

    /// Find an expectation by ID
    async fn find_expected(&self, id: &CallbackId)
        -> Result<Option<ExpectedCallback>, EngineError>;

    /// The oldest PENDING expectation matching a correlation key
    async fn oldest_pending_for_key(
        &self,
        key: &CorrelationKey,
    ) -> Result<Option<ExpectedCallback>, EngineError>;

    /// All PENDING expectations whose deadline is at or before `now`
    async fn expired_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExpectedCallback>, EngineError>;

    /// Persist a received callback
    async fn save_received(&self, received: &ReceivedCallback) -> Result<(), EngineError>;

    /// Find a received callback by ID
    async fn find_received(
        &self,
        id: &CallbackId,
    ) -> Result<Option<ReceivedCallback>, EngineError>;

    /// All received callbacks not yet matched to an expectation
    async fn unprocessed_received(&self) -> Result<Vec<ReceivedCallback>, EngineError>;
}

/// Repository for TSQ requests
#[async_trait]
pub trait TsqRepository: Send + Sync {
    /// Find a request by ID
    async fn find_by_id(&self, id: &TsqId) -> Result<Option<TsqRequest>, EngineError>;

    /// Save a request
    async fn save(&self, request: &TsqRequest) -> Result<(), EngineError>;

    /// All PENDING requests due at `now`
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<TsqRequest>, EngineError>;
}

/// Repository for reversal requests
#[async_trait]
pub trait ReversalRepository: Send + Sync {
    /// Find a reversal by ID
    async fn find_by_id(&self, id: &ReversalId) -> Result<Option<ReversalRequest>, EngineError>;

    /// Save a reversal
    async fn save(&self, reversal: &ReversalRequest) -> Result<(), EngineError>;

    /// All reversals raised for an instance
    async fn find_by_instance(
        &self,
        instance_id: &InstanceId,
    ) -> Result<Vec<ReversalRequest>, EngineError>;
}

/// Repository for queued jobs
///
/// `claim` is the storage-layer concurrency contract: atomically select
/// up to `batch_size` due PENDING jobs ordered by priority descending
/// then age ascending, and mark them PROCESSING under the worker's lease
/// in the same step. Two racing claims must never return the same job.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Find a job by ID
    async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, EngineError>;

    /// Save a job
    async fn save(&self, job: &Job) -> Result<(), EngineError>;

    /// Atomically claim a batch of due jobs for a worker
    async fn claim(&self, worker_id: &str, batch_size: usize) -> Result<Vec<Job>, EngineError>;

    /// Return jobs whose lease exceeded `threshold` to PENDING; returns
    /// the reclaimed IDs
    async fn reclaim_stale(
        &self,
        threshold: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, EngineError>;

    /// Delete terminal jobs older than `cutoff`; returns the number purged
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, EngineError>;
}

/// In-memory implementations for testing and single-process deployments
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// In-memory flow definition repository
    #[derive(Default)]
    pub struct MemoryFlowDefinitionRepository {
        definitions: DashMap<String, FlowDefinition>,
    }

    impl MemoryFlowDefinitionRepository {
        /// Create a new memory flow definition repository
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl FlowDefinitionRepository for MemoryFlowDefinitionRepository {
        async fn find_by_id(&self, id: &FlowId) -> Result<Option<FlowDefinition>, EngineError> {
            Ok(self.definitions.get(&id.0).map(|d| d.clone()))
        }

        async fn find_by_code(&self, code: &str) -> Result<Option<FlowDefinition>, EngineError> {
            Ok(self
                .definitions
                .iter()
                .filter(|entry| entry.code == code)
                .max_by_key(|entry| entry.version)
                .map(|entry| entry.clone()))
        }

        async fn save(&self, definition: &FlowDefinition) -> Result<(), EngineError> {
            self.definitions
                .insert(definition.id.0.clone(), definition.clone());
            Ok(())
        }
    }

    /// In-memory flow instance repository with a correlation-key index
    #[derive(Default)]
    pub struct MemoryFlowInstanceRepository {
        instances: DashMap<String, FlowInstance>,
        by_key: DashMap<CorrelationKey, String>,
    }

    impl MemoryFlowInstanceRepository {
        /// Create a new memory flow instance repository
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl FlowInstanceRepository for MemoryFlowInstanceRepository {
        async fn find_by_id(&self, id: &InstanceId) -> Result<Option<FlowInstance>, EngineError> {
            Ok(self.instances.get(&id.0).map(|i| i.clone()))
        }

        async fn find_by_key(
            &self,
            key: &CorrelationKey,
        ) -> Result<Option<FlowInstance>, EngineError> {
            let Some(id) = self.by_key.get(key).map(|id| id.clone()) else {
                return Ok(None);
            };
            Ok(self.instances.get(&id).map(|i| i.clone()))
        }

        async fn save(&self, instance: &FlowInstance) -> Result<(), EngineError> {
            let key = CorrelationKey {
                session_id: instance.session_id.clone(),
                tracking_number: instance.tracking_number.clone(),
            };
            self.by_key.insert(key, instance.id.0.clone());
            self.instances.insert(instance.id.0.clone(), instance.clone());
            Ok(())
        }

        async fn list_by_status(
            &self,
            status: InstanceStatus,
        ) -> Result<Vec<FlowInstance>, EngineError> {
            Ok(self
                .instances
                .iter()
                .filter(|entry| entry.status == status)
                .map(|entry| entry.clone())
                .collect())
        }
    }

    /// In-memory step execution repository
    #[derive(Default)]
    pub struct MemoryStepExecutionRepository {
        executions: DashMap<String, StepExecution>,
    }

    impl MemoryStepExecutionRepository {
        /// Create a new memory step execution repository
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl StepExecutionRepository for MemoryStepExecutionRepository {
        async fn find_by_id(
            &self,
            id: &StepExecutionId,
        ) -> Result<Option<StepExecution>, EngineError> {
            Ok(self.executions.get(&id.0).map(|e| e.clone()))
        }

        async fn save(&self, execution: &StepExecution) -> Result<(), EngineError> {
            self.executions
                .insert(execution.id.0.clone(), execution.clone());
            Ok(())
        }

        async fn find_open_for_instance(
            &self,
            instance_id: &InstanceId,
        ) -> Result<Option<StepExecution>, EngineError> {
            Ok(self
                .executions
                .iter()
                .filter(|entry| {
                    &entry.instance_id == instance_id && !entry.status.is_terminal()
                })
                .max_by_key(|entry| entry.created_at)
                .map(|entry| entry.clone()))
        }
    }

    /// In-memory callback repository
    #[derive(Default)]
    pub struct MemoryCallbackRepository {
        expected: DashMap<String, ExpectedCallback>,
        received: DashMap<String, ReceivedCallback>,
    }

    impl MemoryCallbackRepository {
        /// Create a new memory callback repository
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl CallbackRepository for MemoryCallbackRepository {
        async fn save_expected(&self, expected: &ExpectedCallback) -> Result<(), EngineError> {
            if expected.status == ExpectedCallbackStatus::Pending {
                let conflicting = self.expected.iter().any(|entry| {
                    entry.instance_id == expected.instance_id
                        && entry.status == ExpectedCallbackStatus::Pending
                        && entry.id != expected.id
                });
                if conflicting {
                    return Err(EngineError::CallbackError(format!(
                        "Instance {} already has a pending expected callback",
                        expected.instance_id
                    )));
                }
            }

            self.expected.insert(expected.id.0.clone(), expected.clone());
            Ok(())
        }

        async fn find_expected(
            &self,
            id: &CallbackId,
        ) -> Result<Option<ExpectedCallback>, EngineError> {
            Ok(self.expected.get(&id.0).map(|e| e.clone()))
        }

        async fn oldest_pending_for_key(
            &self,
            key: &CorrelationKey,
        ) -> Result<Option<ExpectedCallback>, EngineError> {
            Ok(self
                .expected
                .iter()
                .filter(|entry| {
                    entry.status == ExpectedCallbackStatus::Pending && &entry.key == key
                })
                .min_by_key(|entry| entry.created_at)
                .map(|entry| entry.clone()))
        }

        async fn expired_pending(
            &self,
            now: DateTime<Utc>,
        ) -> Result<Vec<ExpectedCallback>, EngineError> {
            Ok(self
                .expected
                .iter()
                .filter(|entry| entry.is_expired(now))
                .map(|entry| entry.clone())
                .collect())
        }

        async fn save_received(&self, received: &ReceivedCallback) -> Result<(), EngineError> {
            self.received.insert(received.id.0.clone(), received.clone());
            Ok(())
        }

        async fn find_received(
            &self,
            id: &CallbackId,
        ) -> Result<Option<ReceivedCallback>, EngineError> {
            Ok(self.received.get(&id.0).map(|r| r.clone()))
        }

        async fn unprocessed_received(&self) -> Result<Vec<ReceivedCallback>, EngineError> {
            let mut callbacks: Vec<ReceivedCallback> = self
                .received
                .iter()
                .filter(|entry| !entry.processed)
                .map(|entry| entry.clone())
                .collect();
            callbacks.sort_by_key(|c| c.received_at);
            Ok(callbacks)
        }
    }

    /// In-memory TSQ repository
    #[derive(Default)]
    pub struct MemoryTsqRepository {
        requests: DashMap<String, TsqRequest>,
    }

    impl MemoryTsqRepository {
        /// Create a new memory TSQ repository
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl TsqRepository for MemoryTsqRepository {
        async fn find_by_id(&self, id: &TsqId) -> Result<Option<TsqRequest>, EngineError> {
            Ok(self.requests.get(&id.0).map(|r| r.clone()))
        }

        async fn save(&self, request: &TsqRequest) -> Result<(), EngineError> {
            self.requests.insert(request.id.0.clone(), request.clone());
            Ok(())
        }

        async fn due(&self, now: DateTime<Utc>) -> Result<Vec<TsqRequest>, EngineError> {
            Ok(self
                .requests
                .iter()
                .filter(|entry| entry.is_due(now))
                .map(|entry| entry.clone())
                .collect())
        }
    }

    /// In-memory reversal repository
    #[derive(Default)]
    pub struct MemoryReversalRepository {
        reversals: DashMap<String, ReversalRequest>,
    }

    impl MemoryReversalRepository {
        /// Create a new memory reversal repository
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl ReversalRepository for MemoryReversalRepository {
        async fn find_by_id(
            &self,
            id: &ReversalId,
        ) -> Result<Option<ReversalRequest>, EngineError> {
            Ok(self.reversals.get(&id.0).map(|r| r.clone()))
        }

        async fn save(&self, reversal: &ReversalRequest) -> Result<(), EngineError> {
            self.reversals.insert(reversal.id.0.clone(), reversal.clone());
            Ok(())
        }

        async fn find_by_instance(
            &self,
            instance_id: &InstanceId,
        ) -> Result<Vec<ReversalRequest>, EngineError> {
            Ok(self
                .reversals
                .iter()
                .filter(|entry| &entry.instance_id == instance_id)
                .map(|entry| entry.clone())
                .collect())
        }
    }

    /// In-memory job repository
    ///
    /// The whole job table sits behind one async mutex so that `claim`
    /// is a single critical section, the equivalent of the row-locking
    /// claim query a SQL implementation would use.
    pub struct MemoryJobRepository {
        jobs: Arc<Mutex<std::collections::HashMap<String, Job>>>,
    }

    impl MemoryJobRepository {
        /// Create a new memory job repository
        pub fn new() -> Self {
            Self {
                jobs: Arc::new(Mutex::new(std::collections::HashMap::new())),
            }
        }
    }

    impl Default for MemoryJobRepository {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl JobRepository for MemoryJobRepository {
        async fn find_by_id(&self, id: &JobId) -> Result<Option<Job>, EngineError> {
            let jobs = self.jobs.lock().await;
            Ok(jobs.get(&id.0).cloned())
        }

        async fn save(&self, job: &Job) -> Result<(), EngineError> {
            let mut jobs = self.jobs.lock().await;
            jobs.insert(job.id.0.clone(), job.clone());
            Ok(())
        }

        async fn claim(
            &self,
            worker_id: &str,
            batch_size: usize,
        ) -> Result<Vec<Job>, EngineError> {
            let now = Utc::now();
            let mut jobs = self.jobs.lock().await;

            let mut due: Vec<&Job> = jobs.values().filter(|j| j.is_due(now)).collect();
            // Priority descending, then age ascending
            due.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
            });

            let selected: Vec<String> = due
                .into_iter()
                .take(batch_size)
                .map(|j| j.id.0.clone())
                .collect();

            let mut claimed = Vec::with_capacity(selected.len());
            for id in selected {
                if let Some(job) = jobs.get_mut(&id) {
                    job.lease(worker_id, now);
                    claimed.push(job.clone());
                }
            }

            Ok(claimed)
        }

        async fn reclaim_stale(
            &self,
            threshold: Duration,
            now: DateTime<Utc>,
        ) -> Result<Vec<JobId>, EngineError> {
            let mut jobs = self.jobs.lock().await;
            let mut reclaimed = Vec::new();

            for job in jobs.values_mut() {
                if job.lease_is_stale(threshold, now) {
                    job.reclaim();
                    reclaimed.push(job.id.clone());
                }
            }

            Ok(reclaimed)
        }

        async fn purge_terminal_before(
            &self,
            cutoff: DateTime<Utc>,
        ) -> Result<usize, EngineError> {
            let mut jobs = self.jobs.lock().await;
            let before = jobs.len();
            jobs.retain(|_, job| !(job.status.is_terminal() && job.updated_at < cutoff));
            Ok(before - jobs.len())
        }
    }
}
