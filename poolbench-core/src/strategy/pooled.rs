//! Bounded connection pool.
//!
//! Capacity is a semaphore of `max_size` permits; a permit is held for as
//! long as a handle is checked out. The idle deque and checked-out counter
//! sit behind one mutex that is only held for list/counter updates, never
//! across a connect, close, or statement.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, info, trace, warn};

use super::{ConnectionHandle, ConnectionStrategy, StrategyKind};
use crate::backend::Connector;
use crate::config::PoolConfig;
use crate::error::{BenchError, Result};

#[derive(Debug, Default)]
struct PoolState {
    idle: VecDeque<ConnectionHandle>,
    checked_out: usize,
}

/// Capacity and bookkeeping shared between the pool and its leased handles.
pub(crate) struct PoolShared {
    permits: Semaphore,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give back the slot of a handle that was dropped instead of released.
    pub(crate) fn reclaim(&self) {
        {
            let mut state = self.state();
            state.checked_out = state.checked_out.saturating_sub(1);
        }
        self.permits.add_permits(1);
    }
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub idle: usize,
    pub checked_out: usize,
    pub max_size: usize,
}

/// Checks handles out of, and back into, a shared bounded pool.
pub struct PooledStrategy {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    shared: Arc<PoolShared>,
}

impl PooledStrategy {
    /// Build the pool and open `min_size` connections up front.
    pub async fn connect(connector: Arc<dyn Connector>, config: PoolConfig) -> Result<Self> {
        if config.max_size == 0 || config.min_size > config.max_size {
            return Err(BenchError::invalid_config(format!(
                "pool size range [{}, {}] is empty",
                config.min_size, config.max_size
            )));
        }

        let mut idle = VecDeque::with_capacity(config.max_size);
        for _ in 0..config.min_size {
            match connector.connect().await {
                Ok(conn) => idle.push_back(ConnectionHandle::new(conn)),
                Err(err) => {
                    for handle in idle.drain(..) {
                        handle.close().await;
                    }
                    return Err(err);
                }
            }
        }

        info!(
            backend = %connector.describe(),
            min = config.min_size,
            max = config.max_size,
            timeout = ?config.acquire_timeout,
            "connection pool ready"
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                permits: Semaphore::new(config.max_size),
                state: Mutex::new(PoolState {
                    idle,
                    checked_out: 0,
                }),
            }),
            connector,
            config,
        })
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.state();
        PoolStatus {
            idle: state.idle.len(),
            checked_out: state.checked_out,
            max_size: self.config.max_size,
        }
    }
}

#[async_trait]
impl ConnectionStrategy for PooledStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Pooled
    }

    async fn acquire(&self) -> Result<ConnectionHandle> {
        let started = Instant::now();
        let permits = &self.shared.permits;
        let permit = match tokio::time::timeout(self.config.acquire_timeout, permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(BenchError::PoolClosed),
            Err(_) => {
                let waited = started.elapsed();
                debug!(?waited, "pool exhausted");
                return Err(BenchError::PoolExhausted { waited });
            }
        };

        let reused = {
            let mut state = self.shared.state();
            let handle = state.idle.pop_front();
            if handle.is_some() {
                state.checked_out += 1;
            }
            handle
        };

        let mut handle = match reused {
            Some(handle) => {
                trace!(handle = handle.id(), "reusing pooled connection");
                handle
            }
            None => {
                // The permit is still scoped here, so a failed or cancelled
                // connect hands it straight back
                let conn = self.connector.connect().await?;
                self.shared.state().checked_out += 1;
                let handle = ConnectionHandle::new(conn);
                debug!(handle = handle.id(), "opened pooled connection");
                handle
            }
        };

        // From here the lease owns the capacity until release or drop
        permit.forget();
        handle.start_lease(self.shared.clone());
        Ok(handle)
    }

    async fn release(&self, mut handle: ConnectionHandle) {
        if handle.end_lease().is_none() {
            debug!(handle = handle.id(), "closing connection that was not checked out of this pool");
            handle.close().await;
            return;
        }

        let discard = handle.is_broken() || self.shared.permits.is_closed();
        let to_close = {
            let mut state = self.shared.state();
            state.checked_out = state.checked_out.saturating_sub(1);
            if discard {
                Some(handle)
            } else {
                state.idle.push_back(handle);
                None
            }
        };

        if let Some(handle) = to_close {
            if handle.is_broken() {
                warn!(handle = handle.id(), "discarding broken pooled connection");
            }
            handle.close().await;
        }
        self.shared.permits.add_permits(1);
    }

    async fn shutdown(&self) {
        self.shared.permits.close();
        let idle: Vec<_> = self.shared.state().idle.drain(..).collect();
        let count = idle.len();
        for handle in idle {
            handle.close().await;
        }
        info!(closed = count, "connection pool shut down");
    }
}
