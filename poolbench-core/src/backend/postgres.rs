//! PostgreSQL backend over single sqlx connections.
//!
//! No `PgPool` here. Strategies own connection lifetime; this layer opens a
//! connection, runs one statement per call and closes.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection as _};
use tracing::{debug, info};

use super::{Connection, Connector};
use crate::error::{BenchError, Result};
use crate::model::Entity;

const INSERT_USER: &str = "INSERT INTO users (username, email) VALUES ($1, $2) RETURNING id::int8";
const SELECT_USER: &str = "SELECT id::int8, username, email FROM users WHERE id = $1";
const UPDATE_EMAIL: &str = "UPDATE users SET email = $1 WHERE id = $2";
const DELETE_USER: &str = "DELETE FROM users WHERE id = $1";

/// Opens one `PgConnection` per `connect()` call.
#[derive(Debug, Clone)]
pub struct PgConnector {
    options: PgConnectOptions,
}

impl PgConnector {
    pub fn new(options: PgConnectOptions) -> Self {
        // Statement logging off while timing
        Self {
            options: options.disable_statement_logging(),
        }
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn Connection>> {
        let conn = self
            .options
            .connect()
            .await
            .map_err(|err| classify(err, None))?;
        Ok(Box::new(PgBackendConnection { conn }))
    }

    fn describe(&self) -> String {
        format!(
            "postgres://{}:{}/{}",
            self.options.get_host(),
            self.options.get_port(),
            self.options.get_database().unwrap_or_default()
        )
    }
}

struct PgBackendConnection {
    conn: PgConnection,
}

#[async_trait]
impl Connection for PgBackendConnection {
    async fn insert_user(&mut self, username: &str, email: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(INSERT_USER)
            .bind(username)
            .bind(email)
            .fetch_one(&mut self.conn)
            .await
            .map_err(|err| classify(err, None))
    }

    async fn select_user(&mut self, id: i64) -> Result<Entity> {
        let (id, username, email) = sqlx::query_as::<_, (i64, String, String)>(SELECT_USER)
            .bind(id)
            .fetch_one(&mut self.conn)
            .await
            .map_err(|err| classify(err, Some(id)))?;
        Ok(Entity::new(username, email).with_id(id))
    }

    async fn update_email(&mut self, id: i64, email: &str) -> Result<()> {
        let result = sqlx::query(UPDATE_EMAIL)
            .bind(email)
            .bind(id)
            .execute(&mut self.conn)
            .await
            .map_err(|err| classify(err, Some(id)))?;
        if result.rows_affected() == 0 {
            return Err(BenchError::NotFound { id });
        }
        Ok(())
    }

    async fn delete_user(&mut self, id: i64) -> Result<()> {
        let result = sqlx::query(DELETE_USER)
            .bind(id)
            .execute(&mut self.conn)
            .await
            .map_err(|err| classify(err, Some(id)))?;
        if result.rows_affected() == 0 {
            return Err(BenchError::NotFound { id });
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.conn.close().await.map_err(|err| classify(err, None))
    }
}

/// Map a sqlx error onto the harness taxonomy.
///
/// `id` is the primary key the statement targeted, used for `RowNotFound`.
fn classify(err: sqlx::Error, id: Option<i64>) -> BenchError {
    match err {
        sqlx::Error::RowNotFound => match id {
            Some(id) => BenchError::NotFound { id },
            None => BenchError::database("statement returned no rows"),
        },
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() {
                return BenchError::constraint(db.message());
            }
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            if is_connection_sqlstate(&code) {
                BenchError::connection(format!("{} (SQLSTATE {})", db.message(), code))
            } else {
                BenchError::database(format!("{} (SQLSTATE {})", db.message(), code))
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::Configuration(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => BenchError::connection(err.to_string()),
        other => BenchError::database(other.to_string()),
    }
}

/// SQLSTATE classes that mean the session itself is unusable.
fn is_connection_sqlstate(code: &str) -> bool {
    code.starts_with("08") // connection exception
        || code.starts_with("28") // invalid authorization
        || code == "3D000" // database does not exist
        || code.starts_with("57P") // admin/crash shutdown
}

/// Create the `users` table if it does not exist yet.
pub async fn ensure_schema(options: &PgConnectOptions) -> Result<()> {
    let mut conn = options.connect().await.map_err(|err| classify(err, None))?;

    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = 'users')",
    )
    .fetch_one(&mut conn)
    .await
    .map_err(|err| classify(err, None))?;

    if exists {
        debug!("table 'users' already present");
    } else {
        info!("table 'users' does not exist, creating");
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id SERIAL PRIMARY KEY,
                username VARCHAR(50) UNIQUE NOT NULL,
                email VARCHAR(100) UNIQUE NOT NULL,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            )
            "#,
        )
        .execute(&mut conn)
        .await
        .map_err(|err| classify(err, None))?;
    }

    conn.close().await.map_err(|err| classify(err, None))
}
