//! Idempotency Guard
//!
//! Keyed, TTL-bounded store guaranteeing at-most-one execution per
//! idempotency key. The first caller for a key is admitted; concurrent
//! duplicates either block until that execution completes (default) or are
//! rejected outright, and later duplicates replay the stored result verbatim
//! until the record expires.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::clock::{SharedClock, SystemClock};
use crate::error::DispatchError;
use crate::handler::panic_reason;
use crate::message::BoxedMessage;
use crate::middleware::{Middleware, Next, StageResult};

/// Behavior when a second caller presents a key that is still executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InFlightPolicy {
    /// Block until the first execution completes, then return its result.
    Wait,
    /// Immediately reject the duplicate with a conflict error.
    Reject,
}

/// Idempotency guard configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Record lifetime after completion; expired records behave as absent.
    pub default_ttl: Duration,
    /// Duplicate-in-flight handling; `Wait` is the default so idempotent
    /// commands converge to one result.
    pub in_flight_policy: InFlightPolicy,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            in_flight_policy: InFlightPolicy::Wait,
        }
    }
}

/// Stored outcome of the first execution for a key.
pub type StoredResult = StageResult;

enum RecordStatus {
    InFlight { done: watch::Sender<bool> },
    Completed { result: StoredResult, expires_at: Duration },
}

struct IdempotencyRecord {
    status: RecordStatus,
    created_at: Duration,
}

/// Admission decision for one idempotency key.
pub enum Admission {
    /// Caller owns the first execution and must `complete` the key.
    Admitted,
    /// Key completed earlier; the stored result is replayed verbatim.
    Duplicate(StoredResult),
    /// Another execution for this key is still in flight.
    DuplicateInFlight(InFlightWaiter),
}

/// Waits for the in-flight execution owning a key to complete.
pub struct InFlightWaiter {
    done: watch::Receiver<bool>,
}

impl InFlightWaiter {
    /// Resolves once the owning execution has completed its record.
    ///
    /// A completion racing with this await is not lost: the watch channel
    /// marks the value changed for receivers created before the send.
    pub async fn wait(mut self) {
        let _ = self.done.changed().await;
    }
}

#[derive(Debug, Default)]
struct Counters {
    admitted: AtomicU64,
    replayed: AtomicU64,
    expired: AtomicU64,
}

/// Keyed at-most-once guard with TTL-bounded result replay.
///
/// Entries live in sharded map cells, so unrelated keys never contend on a
/// single lock. Owned explicitly by the application and shared with the bus
/// builder; `clear` exists for test isolation.
pub struct IdempotencyGuard {
    records: DashMap<String, IdempotencyRecord>,
    config: IdempotencyConfig,
    clock: SharedClock,
    counters: Counters,
}

impl IdempotencyGuard {
    pub fn new(config: IdempotencyConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(config: IdempotencyConfig, clock: SharedClock) -> Self {
        Self {
            records: DashMap::new(),
            config,
            clock,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Atomic check-and-mark for `key`.
    ///
    /// Exactly one of any set of concurrent callers is admitted; the rest
    /// observe the in-flight execution or the completed result. Expired
    /// records are treated as absent and the key is re-admitted.
    pub fn begin(&self, key: &str) -> Admission {
        let now = self.clock.now();
        match self.records.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(IdempotencyRecord {
                    status: RecordStatus::InFlight {
                        done: watch::channel(false).0,
                    },
                    created_at: now,
                });
                self.counters.admitted.fetch_add(1, Ordering::Relaxed);
                Admission::Admitted
            }
            Entry::Occupied(mut slot) => {
                let expired = matches!(
                    &slot.get().status,
                    RecordStatus::Completed { expires_at, .. } if now > *expires_at
                );
                if expired {
                    tracing::debug!(
                        key = %key,
                        age.secs = (now.saturating_sub(slot.get().created_at)).as_secs(),
                        "Expired idempotency record replaced"
                    );
                    slot.insert(IdempotencyRecord {
                        status: RecordStatus::InFlight {
                            done: watch::channel(false).0,
                        },
                        created_at: now,
                    });
                    self.counters.expired.fetch_add(1, Ordering::Relaxed);
                    self.counters.admitted.fetch_add(1, Ordering::Relaxed);
                    return Admission::Admitted;
                }

                match &slot.get().status {
                    RecordStatus::InFlight { done } => Admission::DuplicateInFlight(InFlightWaiter {
                        done: done.subscribe(),
                    }),
                    RecordStatus::Completed { result, .. } => {
                        self.counters.replayed.fetch_add(1, Ordering::Relaxed);
                        Admission::Duplicate(clone_stored(result))
                    }
                }
            }
        }
    }

    /// Stores the outcome for `key` and wakes blocked duplicates.
    ///
    /// `ttl` of `None` uses the guard's default. The stored result, success
    /// or failure, is what every duplicate caller receives until expiry.
    pub fn complete(&self, key: &str, result: StoredResult, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let expires_at = self.clock.now().saturating_add(ttl);

        let previous = match self.records.get_mut(key) {
            Some(mut record) => std::mem::replace(
                &mut record.status,
                RecordStatus::Completed { result, expires_at },
            ),
            None => return,
        };

        // Wake waiters only after the shard lock is released.
        if let RecordStatus::InFlight { done } = previous {
            done.send_replace(true);
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Removes all records (test isolation).
    pub fn clear(&self) {
        self.records.clear();
    }

    /// Drops completed records past their expiry.
    pub fn sweep_expired(&self) {
        let now = self.clock.now();
        self.records.retain(|_, record| {
            !matches!(
                &record.status,
                RecordStatus::Completed { expires_at, .. } if now > *expires_at
            )
        });
    }

    /// Snapshot of guard activity.
    pub fn stats(&self) -> IdempotencyStats {
        IdempotencyStats {
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            replayed: self.counters.replayed.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            records: self.records.len(),
        }
    }
}

/// Snapshot of guard activity.
#[derive(Debug, Clone)]
pub struct IdempotencyStats {
    /// Keys admitted for a fresh execution
    pub admitted: u64,
    /// Stored results replayed to duplicate callers
    pub replayed: u64,
    /// Expired records replaced by a fresh execution
    pub expired: u64,
    /// Live records
    pub records: usize,
}

fn clone_stored(result: &StoredResult) -> StoredResult {
    match result {
        Ok(value) => Ok(value.clone_boxed()),
        Err(err) => Err(err.clone()),
    }
}

/// Idempotency stage, outermost business stage in the command chain.
///
/// Duplicate suppression happens before validation, retries or breaker
/// accounting so a replayed command never re-attempts a side effect. An
/// admitted execution runs on a detached task: if the dispatching caller is
/// cancelled, the execution still completes its record and unblocks waiters.
pub struct IdempotencyMiddleware {
    guard: Arc<IdempotencyGuard>,
}

impl IdempotencyMiddleware {
    pub fn new(guard: Arc<IdempotencyGuard>) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Middleware for IdempotencyMiddleware {
    async fn handle(&self, message: BoxedMessage, next: Next) -> StageResult {
        let Some(key) = next.meta().idempotency_key.clone() else {
            return next.run(message).await;
        };

        let mut admission = self.guard.begin(&key);
        loop {
            match admission {
                Admission::Admitted => {
                    let guard = Arc::clone(&self.guard);
                    let ttl = next.meta().idempotency_ttl;
                    let chain = next.clone();
                    let task_key = key.clone();

                    let execution = tokio::spawn(async move {
                        let result = match AssertUnwindSafe(chain.run(message)).catch_unwind().await
                        {
                            Ok(result) => result,
                            Err(panic) => Err(DispatchError::Fatal {
                                reason: panic_reason(panic),
                            }),
                        };
                        guard.complete(&task_key, clone_stored(&result), ttl);
                        result
                    });

                    return match execution.await {
                        Ok(result) => result,
                        Err(_) => Err(DispatchError::Fatal {
                            reason: format!("idempotent execution for key {key} aborted"),
                        }),
                    };
                }
                Admission::Duplicate(stored) => {
                    tracing::debug!(key = %key, "Replaying stored idempotent result");
                    return stored;
                }
                Admission::DuplicateInFlight(waiter) => {
                    match self.guard.config().in_flight_policy {
                        InFlightPolicy::Reject => {
                            tracing::warn!(key = %key, "Duplicate command rejected while in flight");
                            return Err(DispatchError::Conflict { key });
                        }
                        InFlightPolicy::Wait => {
                            tracing::debug!(key = %key, "Waiting for in-flight idempotent execution");
                            waiter.wait().await;
                            admission = self.guard.begin(&key);
                        }
                    }
                }
            }
        }
    }
}
