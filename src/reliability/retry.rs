use std::fmt;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::logging::{self, obj, v_int, v_str, Domain};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterMode {
    None,
    /// Offset in `[0, delay/4)` derived from SHA-256 of `op_key|attempt`.
    Hash,
}

impl JitterMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Some(Self::None),
            "hash" => Some(Self::Hash),
            _ => None,
        }
    }
}

/// Retry configuration. Stateless; safe to share and copy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total calls allowed, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: JitterMode,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter: JitterMode::Hash,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt_idx` (0-based), in milliseconds.
    /// Identical inputs always give identical output, across processes too.
    pub fn compute_delay(&self, attempt_idx: u32, op_key: &str) -> u64 {
        let raw = self.base_delay_ms as f64 * self.multiplier.powi(attempt_idx as i32);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64).max(0.0) as u64
        } else {
            self.max_delay_ms
        };
        match self.jitter {
            JitterMode::None => capped,
            JitterMode::Hash => {
                let span = capped / 4;
                if span == 0 {
                    capped
                } else {
                    capped + stable_hash(op_key, attempt_idx) % span
                }
            }
        }
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

fn stable_hash(op_key: &str, attempt_idx: u32) -> u64 {
    let digest = Sha256::digest(format!("{}|{}", op_key, attempt_idx).as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Why a retried operation ultimately failed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The predicate classified the failure as permanent.
    Fatal { error: E, attempts: u32 },
    /// Every attempt failed with a retryable error.
    Exhausted { last: E, attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Fatal { attempts, .. } | RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Fatal { error, .. } => error,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Fatal { error, attempts } => {
                write!(f, "non-retryable failure after {} attempt(s): {}", attempts, error)
            }
            RetryError::Exhausted { last, attempts } => {
                write!(f, "retries exhausted after {} attempt(s): {}", attempts, last)
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RetryError::Fatal { error, .. } => Some(error),
            RetryError::Exhausted { last, .. } => Some(last),
        }
    }
}

/// Production sleeper.
pub fn thread_sleep(d: Duration) {
    std::thread::sleep(d);
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// Returns the value and the number of calls made. `sleep` is injected so
/// tests can record delays without waiting.
pub fn execute<T, E, F, P>(
    policy: &RetryPolicy,
    op_key: &str,
    is_retryable: P,
    sleep: &mut dyn FnMut(Duration),
    mut op: F,
) -> Result<(T, u32), RetryError<E>>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: fmt::Display,
{
    let max = policy.attempts();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match op() {
            Ok(value) => return Ok((value, attempt)),
            Err(error) if !is_retryable(&error) => {
                return Err(RetryError::Fatal { error, attempts: attempt });
            }
            Err(error) if attempt >= max => {
                logging::warn(
                    Domain::Retry,
                    "exhausted",
                    obj(&[
                        ("op_key", v_str(op_key)),
                        ("attempts", v_int(attempt as u64)),
                        ("error", v_str(&error.to_string())),
                    ]),
                );
                return Err(RetryError::Exhausted { last: error, attempts: attempt });
            }
            Err(error) => {
                let delay = policy.compute_delay(attempt - 1, op_key);
                logging::info(
                    Domain::Retry,
                    "backoff",
                    obj(&[
                        ("op_key", v_str(op_key)),
                        ("attempt", v_int(attempt as u64)),
                        ("max_attempts", v_int(max as u64)),
                        ("delay_ms", v_int(delay)),
                        ("error", v_str(&error.to_string())),
                    ]),
                );
                sleep(Duration::from_millis(delay));
            }
        }
    }
}
