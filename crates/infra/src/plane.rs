//! Process wiring: assemble stores, bus, coordinator, dispatcher and
//! reaper from one configuration block.

use std::sync::Arc;

use walletflow_events::binding::BindingRegistry;
use walletflow_events::bus::{BusError, MessageBus};

use crate::config::EventPlaneConfig;
use crate::health::HealthState;
use crate::inbound::{InboundDispatcher, subscribe_forward};
use crate::outbox::dispatcher::{DispatcherHandle, OutboxDispatcher};
use crate::outbox::store::OutboxStore;
use crate::saga::coordinator::SagaCoordinator;
use crate::saga::reaper::{ReaperHandle, SagaReaper};
use crate::saga::store::SagaStore;

/// Handles of the running event plane workers.
pub struct EventPlaneHandles {
    pub dispatcher: DispatcherHandle,
    pub reaper: ReaperHandle,
    pub health: HealthState,
}

impl EventPlaneHandles {
    /// Stop the workers gracefully. Bus consumer tasks stop with their
    /// adapter.
    pub async fn shutdown(self) {
        self.dispatcher.shutdown().await;
        self.reaper.shutdown().await;
    }
}

/// Wire and start the whole plane: saga consumption on the forward
/// destinations, the outbox drain loop, and the timeout reaper.
pub async fn start<O, S, B>(
    outbox_store: O,
    saga_store: S,
    bus: B,
    registry: BindingRegistry,
    config: EventPlaneConfig,
) -> Result<EventPlaneHandles, BusError>
where
    O: OutboxStore + Clone + Send + Sync + 'static,
    S: SagaStore + Clone + Send + Sync + 'static,
    B: MessageBus + Send + Sync + 'static,
{
    let coordinator = Arc::new(SagaCoordinator::new(
        saga_store.clone(),
        outbox_store.clone(),
        config.saga.clone(),
    ));

    let inbound = Arc::new(InboundDispatcher::new(coordinator.clone()));
    subscribe_forward(&bus, &registry, inbound).await?;

    let dispatcher = OutboxDispatcher::new(
        outbox_store,
        bus,
        Arc::new(registry),
        config.dispatcher.clone(),
    );
    let health = dispatcher.health();
    let dispatcher = dispatcher.spawn();

    let reaper = SagaReaper::new(saga_store, coordinator, config.saga.timeout()).spawn();

    Ok(EventPlaneHandles {
        dispatcher,
        reaper,
        health,
    })
}
