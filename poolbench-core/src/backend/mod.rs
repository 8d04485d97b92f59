//! Store boundary.
//!
//! A `Connector` opens physical connections; a `Connection` issues exactly one
//! statement per call against the `users` table. Strategies only ever see
//! these two traits, so the harness runs unchanged against PostgreSQL or the
//! in-process store.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::Entity;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryConnector, MemoryStore};
pub use postgres::{ensure_schema, PgConnector};

/// A live physical connection.
#[async_trait]
pub trait Connection: Send {
    /// INSERT a user, returning the store-assigned id
    async fn insert_user(&mut self, username: &str, email: &str) -> Result<i64>;

    /// SELECT a user by primary key
    async fn select_user(&mut self, id: i64) -> Result<Entity>;

    /// UPDATE the email of an existing user
    async fn update_email(&mut self, id: i64, email: &str) -> Result<()>;

    /// DELETE a user by primary key
    async fn delete_user(&mut self, id: i64) -> Result<()>;

    /// Terminate the physical connection
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Opens new physical connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Connection>>;

    /// Short label for logs
    fn describe(&self) -> String;
}
