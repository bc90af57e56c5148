//! Drain hot path: one dispatcher tick over a full batch.

use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use serde_json::json;

use walletflow_events::binding::BindingRegistry;
use walletflow_events::event::event_types;
use walletflow_infra::bus::InMemoryBus;
use walletflow_infra::config::DispatcherConfig;
use walletflow_infra::outbox::{
    InMemoryOutboxStore, NewOutboxRecord, OutboxDispatcher, OutboxStore,
};

fn drain_full_batch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("outbox_drain_100", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = InMemoryOutboxStore::arc();
                for i in 0..100 {
                    store
                        .append(NewOutboxRecord::new(
                            event_types::FUNDS_ADDED,
                            json!({"amount": i}),
                        ))
                        .await
                        .unwrap();
                }

                let dispatcher = OutboxDispatcher::new(
                    store,
                    InMemoryBus::arc(3),
                    Arc::new(BindingRegistry::wallet_defaults()),
                    DispatcherConfig::default().with_batch_size(100),
                );
                dispatcher.run_once().await
            })
        })
    });
}

criterion_group!(benches, drain_full_batch);
criterion_main!(benches);
