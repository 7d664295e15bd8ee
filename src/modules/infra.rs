//! Core modules owning the datastore and broker handles.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use folio_db::CatalogStore;
use folio_events::Relay;
use folio_kernel::{InitCtx, Module};

/// Checks the catalog store answers before anything is served
pub struct DatastoreModule {
    store: Arc<dyn CatalogStore>,
}

impl DatastoreModule {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Module for DatastoreModule {
    fn name(&self) -> &'static str {
        "db"
    }

    async fn init(&self, _ctx: &InitCtx<'_>) -> anyhow::Result<()> {
        self.store
            .ping()
            .await
            .with_context(|| format!("catalog store at {} did not answer", self.store.describe()))?;

        tracing::info!(
            module = self.name(),
            store = %self.store.describe(),
            "catalog store reachable"
        );
        Ok(())
    }
}

/// Owns the relay's broker channel; releases it on shutdown.
///
/// The channel itself is acquired lazily by the first enqueue or drain.
pub struct RelayModule {
    relay: Arc<Relay>,
}

impl RelayModule {
    pub fn new(relay: Arc<Relay>) -> Self {
        Self { relay }
    }
}

#[async_trait]
impl Module for RelayModule {
    fn name(&self) -> &'static str {
        "events"
    }

    async fn init(&self, ctx: &InitCtx<'_>) -> anyhow::Result<()> {
        let queue = &ctx.settings.queue;
        tracing::info!(
            module = self.name(),
            broker = %self.relay.describe(),
            drain_window_ms = queue.drain_window_ms,
            prefetch = queue.prefetch,
            max_redeliveries = ?queue.max_redeliveries,
            reclaim_after_ms = queue.reclaim_after_ms,
            "mutation relay configured"
        );
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.relay
            .close()
            .await
            .context("failed to release queue channel")
    }
}
