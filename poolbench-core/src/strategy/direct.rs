use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::{ConnectionHandle, ConnectionStrategy, StrategyKind};
use crate::backend::Connector;
use crate::error::Result;

/// Opens a fresh physical connection for every operation and closes it
/// afterwards.
pub struct DirectStrategy {
    connector: Arc<dyn Connector>,
}

impl DirectStrategy {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }
}

#[async_trait]
impl ConnectionStrategy for DirectStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Direct
    }

    async fn acquire(&self) -> Result<ConnectionHandle> {
        let conn = self.connector.connect().await?;
        let handle = ConnectionHandle::new(conn);
        trace!(handle = handle.id(), "opened direct connection");
        Ok(handle)
    }

    async fn release(&self, handle: ConnectionHandle) {
        trace!(handle = handle.id(), "closing direct connection");
        handle.close().await;
    }
}
