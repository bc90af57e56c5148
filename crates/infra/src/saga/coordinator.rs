//! Saga coordinator: drives per-correlation state machine instances from
//! inbound events.
//!
//! Discipline per instance:
//! - **Serialization**: one async lock per saga id; different sagas
//!   progress in parallel, one saga never applies two commands at once in
//!   this process. Cross-process safety comes from the store's version
//!   guard.
//! - **Idempotency**: applied envelope ids are recorded; a redelivery
//!   mutates nothing and still reports a positively-ackable outcome.
//! - **Optimistic concurrency**: read-compute-write conditional on the
//!   version read, retried up to the configured cap; exhaustion escalates
//!   the instance to FAILED.
//! - **Compensation**: entering FAILED appends reversal events (reverse
//!   order of the forward history) to the outbox, so compensation rides
//!   the same durable at-least-once path as forward events.
//! - **Completion**: `SAGA_COMPLETED` is internal; it is applied right
//!   after the transfer step lands (or when a redelivered transfer event
//!   finds the instance still un-completed).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use walletflow_core::CorrelationId;
use walletflow_events::event::{DomainEvent, WalletEvent};
use walletflow_events::saga::{SagaEventKind, SagaState, compensation_path, transition};

use crate::config::SagaConfig;
use crate::outbox::store::{NewOutboxRecord, OutboxStore};
use crate::saga::store::{SagaInstance, SagaStore, SagaStoreError};

/// One unit of work for the coordinator, built by inbound dispatch, the
/// reaper, or the coordinator itself.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaCommand {
    /// Workflow key; `None` when the envelope carried no correlation id,
    /// in which case there is no instance to touch.
    pub saga_id: Option<CorrelationId>,
    pub event: SagaEventKind,
    /// Envelope identity, the idempotency key.
    pub envelope_id: String,
}

/// Outcome of a submitted command. Every variant is positively ackable;
/// only a store error is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaDecision {
    Applied { from: SagaState, to: SagaState },
    /// Envelope already applied; no state mutation happened.
    Duplicate,
    /// The (state, event) pair is not in the transition table (stale or
    /// out-of-order delivery); no state mutation happened.
    InvalidTransition { state: SagaState },
    /// No correlation id, no instance.
    Unattributable,
}

#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error(transparent)]
    Store(#[from] SagaStoreError),

    #[error("optimistic retries exhausted for saga '{0}'")]
    RetriesExhausted(String),
}

/// Per-correlation state machine coordinator.
pub struct SagaCoordinator<S, O> {
    store: S,
    outbox: O,
    config: SagaConfig,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<S, O> SagaCoordinator<S, O>
where
    S: SagaStore + Send + Sync + 'static,
    O: OutboxStore + Send + Sync + 'static,
{
    pub fn new(store: S, outbox: O, config: SagaConfig) -> Self {
        Self {
            store,
            outbox,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Apply one command. Returns only after the transition is durably
    /// recorded or deterministically rejected as a no-op.
    pub async fn submit(&self, command: SagaCommand) -> Result<SagaDecision, SagaError> {
        let Some(saga_id) = command.saga_id.clone() else {
            warn!(
                envelope_id = %command.envelope_id,
                event = %command.event,
                "saga command without correlation id; no instance created"
            );
            return Ok(SagaDecision::Unattributable);
        };

        let lock = self.lock_for(&saga_id);
        let _guard = lock.lock().await;

        let decision = self
            .apply_with_retry(&saga_id, command.event, &command.envelope_id)
            .await?;

        // The workflow finishes itself once the transfer step has landed.
        // A redelivered transfer event can find the instance still in
        // FUNDS_TRANSFERRED (completion lost to a crash); finish it then
        // too.
        let needs_completion = match decision {
            SagaDecision::Applied {
                to: SagaState::FundsTransferred,
                ..
            } => true,
            SagaDecision::Duplicate => self
                .store
                .load(&saga_id)
                .await?
                .is_some_and(|i| i.state == SagaState::FundsTransferred),
            _ => false,
        };
        if needs_completion {
            let completion_id = format!("internal-completion-{}", command.envelope_id);
            self.apply_with_retry(&saga_id, SagaEventKind::SagaCompleted, &completion_id)
                .await?;
        }

        Ok(decision)
    }

    async fn apply_with_retry(
        &self,
        saga_id: &CorrelationId,
        event: SagaEventKind,
        envelope_id: &str,
    ) -> Result<SagaDecision, SagaError> {
        let cap = self.config.optimistic_retry_cap.max(1);

        for attempt in 1..=cap {
            match self.try_apply(saga_id, event, envelope_id).await {
                Ok(decision) => return Ok(decision),
                Err(err) if err.is_conflict() && attempt < cap => {
                    debug!(saga_id = %saga_id, attempt, "saga version conflict; retrying");
                    continue;
                }
                Err(err) if err.is_conflict() => {
                    warn!(
                        saga_id = %saga_id,
                        %event,
                        "optimistic retries exhausted; escalating saga to FAILED"
                    );
                    return self.escalate_failed(saga_id, envelope_id).await;
                }
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("retry loop returns on every branch")
    }

    /// Terminal escalation after conflict exhaustion: the instance itself
    /// is failed so the workflow does not wedge half-applied.
    async fn escalate_failed(
        &self,
        saga_id: &CorrelationId,
        envelope_id: &str,
    ) -> Result<SagaDecision, SagaError> {
        let cap = self.config.optimistic_retry_cap.max(1);
        let escalation_id = format!("conflict-escalation-{envelope_id}");

        for attempt in 1..=cap {
            match self
                .try_apply(saga_id, SagaEventKind::SagaFailed, &escalation_id)
                .await
            {
                Ok(decision) => return Ok(decision),
                Err(err) if err.is_conflict() && attempt < cap => continue,
                Err(err) if err.is_conflict() => {
                    return Err(SagaError::RetriesExhausted(saga_id.as_str().to_string()));
                }
                Err(err) => return Err(err.into()),
            }
        }
        unreachable!("retry loop returns on every branch")
    }

    /// One read-compute-write cycle.
    async fn try_apply(
        &self,
        saga_id: &CorrelationId,
        event: SagaEventKind,
        envelope_id: &str,
    ) -> Result<SagaDecision, SagaStoreError> {
        let existing = self.store.load(saga_id).await?;
        let mut instance = existing.unwrap_or_else(|| SagaInstance::new(saga_id.clone()));
        let expected = instance.version;

        if instance.has_processed(envelope_id) {
            debug!(
                saga_id = %saga_id,
                envelope_id,
                "duplicate delivery recognized; no state mutation"
            );
            return Ok(SagaDecision::Duplicate);
        }

        let from = instance.state;
        let Some(next) = transition(from, event) else {
            metrics::increment_counter!("saga.invalid_transition");
            warn!(
                saga_id = %saga_id,
                state = %from,
                %event,
                "invalid saga transition rejected"
            );
            return Ok(SagaDecision::InvalidTransition { state: from });
        };

        instance.state = next;
        instance.version += 1;
        instance.updated_at = Utc::now();
        instance.last_event_type = Some(event.as_str().to_string());
        instance.record_processed(envelope_id.to_string());
        self.store.save(&instance, expected).await?;

        metrics::increment_counter!(
            "saga.transition",
            "from" => from.as_str(),
            "to" => next.as_str(),
            "event" => event.as_str()
        );
        info!(saga_id = %saga_id, from = %from, to = %next, %event, "saga transition applied");

        if next == SagaState::Failed {
            self.compensate(saga_id, from).await;
        }

        Ok(SagaDecision::Applied { from, to: next })
    }

    /// Emit reversal events for the forward history that led to `from`.
    ///
    /// Best-effort: an append that keeps failing is counted and skipped
    /// rather than blocking other workflows; the instance is already
    /// durably FAILED at this point.
    async fn compensate(&self, saga_id: &CorrelationId, from: SagaState) {
        let path = compensation_path(from);
        if path.is_empty() {
            return;
        }

        metrics::increment_counter!("saga.compensation_started");
        info!(
            saga_id = %saga_id,
            from = %from,
            steps = path.len(),
            "emitting compensation events"
        );

        for event_type in path {
            let Some(event) = WalletEvent::reversal_for(event_type) else {
                continue;
            };
            let domain_event = DomainEvent::new(event, Some(saga_id.clone()));
            let record = NewOutboxRecord::new(*event_type, domain_event.to_payload())
                .with_correlation(saga_id.clone());

            let mut appended = false;
            for _ in 0..2 {
                match self.outbox.append(record.clone()).await {
                    Ok(_) => {
                        appended = true;
                        break;
                    }
                    Err(err) => {
                        warn!(
                            saga_id = %saga_id,
                            event_type,
                            error = %err,
                            "compensation append failed"
                        );
                    }
                }
            }
            if !appended {
                metrics::increment_counter!(
                    "saga.compensation_failed",
                    "event_type" => *event_type
                );
            }
        }
    }

    fn lock_for(&self, saga_id: &CorrelationId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(saga_id.as_str().to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}
