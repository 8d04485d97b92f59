//! Connection-acquisition strategies under comparison.
//!
//! Both variants implement [`ConnectionStrategy`]; the CRUD operations are
//! provided methods built on `acquire`/`release`, so every statement runs
//! inside the same scoped acquisition and the handle goes back on every exit
//! path.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::{Connection, Connector};
use crate::config::PoolConfig;
use crate::error::Result;
use crate::model::Entity;

mod direct;
mod pooled;

pub use direct::DirectStrategy;
pub use pooled::{PoolStatus, PooledStrategy};
use pooled::PoolShared;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Which strategy produced a set of timings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Direct,
    Pooled,
}

impl StrategyKind {
    pub fn label(self) -> &'static str {
        match self {
            StrategyKind::Direct => "Without Pooling",
            StrategyKind::Pooled => "With Pooling",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Direct => f.write_str("direct"),
            StrategyKind::Pooled => f.write_str("pooled"),
        }
    }
}

const RELEASED: &str = "(bug) connection used after close";

/// A live connection, exclusively owned by one worker between acquire and
/// release.
///
/// A handle checked out of a pool carries a lease on the pool's capacity.
/// Dropping it without `release` discards the connection and gives the slot
/// back, so a panic or a cancelled operation cannot starve the pool.
pub struct ConnectionHandle {
    id: u64,
    conn: Option<Box<dyn Connection>>,
    broken: bool,
    lease: Option<Arc<PoolShared>>,
}

impl ConnectionHandle {
    pub(crate) fn new(conn: Box<dyn Connection>) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            conn: Some(conn),
            broken: false,
            lease: None,
        }
    }

    /// Process-unique identity of the underlying physical connection
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&mut self) -> &mut dyn Connection {
        self.conn.as_deref_mut().expect(RELEASED)
    }

    /// Flag the connection as unusable; a pool closes it on release.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub(crate) fn start_lease(&mut self, pool: Arc<PoolShared>) {
        self.lease = Some(pool);
    }

    pub(crate) fn end_lease(&mut self) -> Option<Arc<PoolShared>> {
        self.lease.take()
    }

    pub(crate) async fn close(mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(err) = conn.close().await {
                debug!(handle = self.id, error = %err, "error while closing connection");
            }
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(pool) = self.lease.take() {
            // Possibly mid-statement, so never returned to idle
            self.conn.take();
            warn!(handle = self.id, "pooled connection dropped without release");
            pool.reclaim();
        }
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("broken", &self.broken)
            .field("leased", &self.lease.is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ConnectionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Obtain a handle for exclusive use.
    async fn acquire(&self) -> Result<ConnectionHandle>;

    /// Give a handle back. Never fails; close errors are logged.
    async fn release(&self, handle: ConnectionHandle);

    /// Tear down any retained connections.
    async fn shutdown(&self) {}

    async fn create_entity(&self, entity: &Entity) -> Result<i64> {
        let mut handle = self.acquire().await?;
        let result = handle
            .connection()
            .insert_user(&entity.username, &entity.email)
            .await;
        release_after(self, handle, result).await
    }

    async fn read_entity(&self, id: i64) -> Result<Entity> {
        let mut handle = self.acquire().await?;
        let result = handle.connection().select_user(id).await;
        release_after(self, handle, result).await
    }

    async fn update_entity(&self, id: i64, new_email: &str) -> Result<()> {
        let mut handle = self.acquire().await?;
        let result = handle.connection().update_email(id, new_email).await;
        release_after(self, handle, result).await
    }

    /// Not idempotent: a missing id fails with `NotFound`.
    async fn delete_entity(&self, id: i64) -> Result<()> {
        let mut handle = self.acquire().await?;
        let result = handle.connection().delete_user(id).await;
        release_after(self, handle, result).await
    }
}

/// Construct the strategy for `kind`. Pooled strategies open `min_size`
/// connections before returning.
pub async fn build_strategy(
    kind: StrategyKind,
    connector: Arc<dyn Connector>,
    pool: &PoolConfig,
) -> Result<Arc<dyn ConnectionStrategy>> {
    let strategy: Arc<dyn ConnectionStrategy> = match kind {
        StrategyKind::Direct => Arc::new(DirectStrategy::new(connector)),
        StrategyKind::Pooled => Arc::new(PooledStrategy::connect(connector, pool.clone()).await?),
    };
    Ok(strategy)
}

/// Release `handle` whatever `result` is, marking it broken first when the
/// statement failed at the connection level.
async fn release_after<S, T>(strategy: &S, mut handle: ConnectionHandle, result: Result<T>) -> Result<T>
where
    S: ConnectionStrategy + ?Sized,
{
    if let Err(err) = &result {
        if err.breaks_connection() {
            handle.mark_broken();
        }
    }
    strategy.release(handle).await;
    result
}
