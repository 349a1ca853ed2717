//! Value comparison, unique-ID generation, and bounded execution helpers.

use crate::ServeError;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::Value;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::timeout;

/// Structural equality over JSON value trees.
///
/// Arrays and objects never compare equal to each other even when their
/// element sets coincide; objects compare by exact key set and recursive
/// values. Owned trees cannot alias, so recursion terminates on any input.
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| deep_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(k, x)| ys.get(k).is_some_and(|y| deep_equal(x, y)))
        }
        // Array-vs-object is a mismatch regardless of contents.
        (Value::Array(_), Value::Object(_)) | (Value::Object(_), Value::Array(_)) => false,
        (x, y) => x == y,
    }
}

/// Races `operation` against a deadline.
///
/// On timeout the pending operation is dropped and an error naming it is
/// returned; on completion the timer is dropped with it.
pub async fn execute_with_timeout<F, T>(
    operation: F,
    timeout_ms: u64,
    operation_name: &str,
) -> Result<T, ServeError>
where
    F: Future<Output = Result<T, ServeError>>,
{
    match timeout(Duration::from_millis(timeout_ms), operation).await {
        Ok(result) => result,
        Err(_) => Err(ServeError::Timeout {
            operation: operation_name.to_string(),
            timeout_ms,
        }),
    }
}

/// Generates `{protocol}_{epoch_ms}_{6 alphanumeric chars}`.
///
/// Unique within a process run; collisions across runs are acceptable.
pub fn generate_server_id(protocol: &str) -> String {
    let epoch_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{}_{}_{}", protocol, epoch_ms, suffix)
}

/// Generates a connection identifier scoped to one pool.
pub fn generate_connection_id(protocol: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    format!("{}_conn_{}", protocol, suffix)
}
