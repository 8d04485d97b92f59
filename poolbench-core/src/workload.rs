//! Synthetic workload generation.
//!
//! Usernames and emails are derived from a monotonic counter plus a
//! run-scoped nonce, so repeated runs against a table that was never cleaned
//! up do not collide on the unique constraints.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

use crate::model::Entity;

/// Run-scoped value that keeps synthetic identities unique across processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunNonce(String);

impl RunNonce {
    /// Start timestamp (microseconds, base 36) plus a short random suffix.
    pub fn generate() -> Self {
        let micros = Utc::now().timestamp_micros().unsigned_abs();
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("{}{}", to_base36(micros), &suffix[..4]))
    }

    /// A fixed nonce, for reproducible workloads.
    pub fn fixed(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Produces batches of unique synthetic entities.
///
/// Each `generate` call continues from where the previous one stopped, so
/// outputs never repeat within a process. `generate_range` is the pure form.
#[derive(Debug)]
pub struct WorkloadGenerator {
    nonce: RunNonce,
    cursor: AtomicU64,
}

impl WorkloadGenerator {
    pub fn new(nonce: RunNonce) -> Self {
        Self {
            nonce,
            cursor: AtomicU64::new(0),
        }
    }

    pub fn nonce(&self) -> &RunNonce {
        &self.nonce
    }

    /// Next `n` entities, in counter order.
    pub fn generate(&self, n: usize) -> Vec<Entity> {
        let start = self.cursor.fetch_add(n as u64, Ordering::Relaxed);
        self.generate_range(start, n)
    }

    /// Entities for counters `start..start + n`. Deterministic given the nonce.
    pub fn generate_range(&self, start: u64, n: usize) -> Vec<Entity> {
        (start..start + n as u64)
            .map(|counter| {
                let username = format!("user_{}_{}", self.nonce, counter);
                let email = format!("{}@test.com", username);
                Entity::new(username, email)
            })
            .collect()
    }
}

/// Replacement email used by the update phase.
pub fn updated_email(entity: &Entity) -> String {
    format!("updated_{}", entity.email)
}
