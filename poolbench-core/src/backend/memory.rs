//! In-process store with the same contract as the `users` table.
//!
//! Unique usernames and emails, sequential ids, `NotFound` on stale ids.
//! Optional latencies emulate connection handshakes and round trips so the
//! strategies show realistic relative costs without a server, and the
//! reachability switch simulates a backend going away.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{Connection, Connector};
use crate::error::{BenchError, Result};
use crate::model::Entity;

#[derive(Debug, Default)]
struct Table {
    rows: BTreeMap<i64, Entity>,
    usernames: HashSet<String>,
    emails: HashSet<String>,
    next_id: i64,
}

#[derive(Debug, Default)]
struct Shared {
    table: Mutex<Table>,
    unreachable: AtomicBool,
    opened: AtomicUsize,
    closed: AtomicUsize,
    connect_latency: Duration,
    statement_latency: Duration,
}

/// Shared in-memory `users` table. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store whose connects and statements sleep for the given durations.
    pub fn with_latency(connect_latency: Duration, statement_latency: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                connect_latency,
                statement_latency,
                ..Shared::default()
            }),
        }
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            store: self.clone(),
        }
    }

    /// While unreachable, connects and statements fail with a connection error.
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn row_count(&self) -> usize {
        self.table().rows.len()
    }

    /// Physical connections opened so far
    pub fn opened_connections(&self) -> usize {
        self.shared.opened.load(Ordering::SeqCst)
    }

    /// Physical connections closed so far
    pub fn closed_connections(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.shared.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.shared.unreachable.load(Ordering::SeqCst) {
            Err(BenchError::connection("server closed the connection unexpectedly"))
        } else {
            Ok(())
        }
    }

    async fn round_trip(&self) -> Result<()> {
        if !self.shared.statement_latency.is_zero() {
            tokio::time::sleep(self.shared.statement_latency).await;
        }
        self.check_reachable()
    }
}

/// Connector handing out connections to a `MemoryStore`.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    store: MemoryStore,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        if !self.store.shared.connect_latency.is_zero() {
            tokio::time::sleep(self.store.shared.connect_latency).await;
        }
        if self.store.shared.unreachable.load(Ordering::SeqCst) {
            return Err(BenchError::connection("connection refused"));
        }
        self.store.shared.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            store: self.store.clone(),
        }))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

struct MemoryConnection {
    store: MemoryStore,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn insert_user(&mut self, username: &str, email: &str) -> Result<i64> {
        self.store.round_trip().await?;
        let mut table = self.store.table();
        if table.usernames.contains(username) {
            return Err(BenchError::constraint(format!(
                "duplicate key value violates unique constraint \"users_username_key\" ({})",
                username
            )));
        }
        if table.emails.contains(email) {
            return Err(BenchError::constraint(format!(
                "duplicate key value violates unique constraint \"users_email_key\" ({})",
                email
            )));
        }
        table.next_id += 1;
        let id = table.next_id;
        table.usernames.insert(username.to_string());
        table.emails.insert(email.to_string());
        table.rows.insert(id, Entity::new(username, email).with_id(id));
        Ok(id)
    }

    async fn select_user(&mut self, id: i64) -> Result<Entity> {
        self.store.round_trip().await?;
        self.store
            .table()
            .rows
            .get(&id)
            .cloned()
            .ok_or(BenchError::NotFound { id })
    }

    async fn update_email(&mut self, id: i64, email: &str) -> Result<()> {
        self.store.round_trip().await?;
        let mut table = self.store.table();
        let current = match table.rows.get(&id) {
            Some(row) => row.email.clone(),
            None => return Err(BenchError::NotFound { id }),
        };
        if current == email {
            return Ok(());
        }
        if table.emails.contains(email) {
            return Err(BenchError::constraint(format!(
                "duplicate key value violates unique constraint \"users_email_key\" ({})",
                email
            )));
        }
        table.emails.remove(&current);
        table.emails.insert(email.to_string());
        if let Some(row) = table.rows.get_mut(&id) {
            row.email = email.to_string();
        }
        Ok(())
    }

    async fn delete_user(&mut self, id: i64) -> Result<()> {
        self.store.round_trip().await?;
        let mut table = self.store.table();
        let row = table.rows.remove(&id).ok_or(BenchError::NotFound { id })?;
        table.usernames.remove(&row.username);
        table.emails.remove(&row.email);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.store.shared.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_crud_contract() {
        let store = MemoryStore::new();
        let mut conn = store.connector().connect().await.unwrap();

        let id = conn.insert_user("alice", "alice@test.com").await.unwrap();
        let row = conn.select_user(id).await.unwrap();
        assert_eq!(row, Entity::new("alice", "alice@test.com").with_id(id));

        conn.update_email(id, "updated_alice@test.com").await.unwrap();
        assert_eq!(conn.select_user(id).await.unwrap().email, "updated_alice@test.com");

        conn.delete_user(id).await.unwrap();
        assert_eq!(conn.select_user(id).await.unwrap_err(), BenchError::NotFound { id });
        assert_eq!(store.row_count(), 0);
    }

    #[tokio::test]
    async fn test_unique_constraints() {
        let store = MemoryStore::new();
        let mut conn = store.connector().connect().await.unwrap();

        let first = conn.insert_user("bob", "bob@test.com").await.unwrap();
        let err = conn.insert_user("bob", "other@test.com").await.unwrap_err();
        assert!(matches!(err, BenchError::ConstraintViolation(_)));
        let err = conn.insert_user("bobby", "bob@test.com").await.unwrap_err();
        assert!(matches!(err, BenchError::ConstraintViolation(_)));

        let second = conn.insert_user("carol", "carol@test.com").await.unwrap();
        assert_ne!(first, second);
        let err = conn.update_email(second, "bob@test.com").await.unwrap_err();
        assert!(matches!(err, BenchError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn test_deleted_identity_can_be_reused() {
        let store = MemoryStore::new();
        let mut conn = store.connector().connect().await.unwrap();
        let id = conn.insert_user("dave", "dave@test.com").await.unwrap();
        conn.delete_user(id).await.unwrap();
        let again = conn.insert_user("dave", "dave@test.com").await.unwrap();
        assert!(again > id);
    }

    #[tokio::test]
    async fn test_unreachable_store() {
        let store = MemoryStore::new();
        let mut conn = store.connector().connect().await.unwrap();

        store.set_reachable(false);
        assert!(store.connector().connect().await.err().unwrap().is_phase_fatal());
        assert!(conn.select_user(1).await.unwrap_err().breaks_connection());

        store.set_reachable(true);
        assert_eq!(conn.select_user(1).await.unwrap_err(), BenchError::NotFound { id: 1 });
    }

    #[tokio::test]
    async fn test_connection_accounting() {
        let store = MemoryStore::new();
        let conn = store.connector().connect().await.unwrap();
        assert_eq!(store.opened_connections(), 1);
        conn.close().await.unwrap();
        assert_eq!(store.closed_connections(), 1);
    }
}
