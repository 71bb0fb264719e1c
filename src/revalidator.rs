//! Background revalidation scheduling.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use log::{debug, warn};
use tokio::runtime::Handle;

use crate::error::Result;

/// Decides when the next revalidation attempt for an entry runs.
///
/// `attempt` starts at 0 and increases by one after each failed attempt;
/// returning `None` ends retrying for that entry key.
pub trait SchedulingStrategy: Send + Sync {
    /// Delay before the given attempt, or `None` to stop.
    fn schedule(&self, attempt: u32) -> Option<Duration>;
}

/// A single immediate attempt, no retries.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateSchedulingStrategy;

impl SchedulingStrategy for ImmediateSchedulingStrategy {
    fn schedule(&self, attempt: u32) -> Option<Duration> {
        (attempt == 0).then_some(Duration::ZERO)
    }
}

/// Immediate first attempt, then a doubling delay per failed attempt,
/// capped at `max_delay`, for at most `max_attempts` attempts.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoffStrategy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Total number of attempts allowed.
    pub max_attempts: u32,
}

impl Default for ExponentialBackoffStrategy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(6),
            max_delay: Duration::from_secs(86_400),
            max_attempts: 5,
        }
    }
}

impl SchedulingStrategy for ExponentialBackoffStrategy {
    fn schedule(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        if attempt == 0 {
            return Some(Duration::ZERO);
        }
        let factor = 2u32.saturating_pow(attempt - 1);
        Some((self.initial_delay * factor).min(self.max_delay))
    }
}

type RevalidationThunk =
    Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Schedules background revalidations, at most one in flight per entry
/// key. Calls arriving while one is pending are coalesced and dropped.
///
/// Failures are logged and rescheduled per the strategy; they never
/// surface to any caller. Closing stops new work without interrupting
/// in-flight tasks.
pub struct AsyncRevalidator {
    handle: Handle,
    strategy: Arc<dyn SchedulingStrategy>,
    in_flight: Arc<DashMap<String, ()>>,
    closed: AtomicBool,
}

impl fmt::Debug for AsyncRevalidator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AsyncRevalidator")
            .field("in_flight", &self.in_flight.len())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl AsyncRevalidator {
    /// Creates a revalidator spawning onto `handle` with a single
    /// immediate attempt per entry.
    #[must_use]
    pub fn new(handle: Handle) -> Self {
        Self::with_strategy(handle, Arc::new(ImmediateSchedulingStrategy))
    }

    /// Creates a revalidator with a custom scheduling strategy.
    #[must_use]
    pub fn with_strategy(
        handle: Handle,
        strategy: Arc<dyn SchedulingStrategy>,
    ) -> Self {
        Self {
            handle,
            strategy,
            in_flight: Arc::new(DashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Schedules a revalidation for `entry_key` unless one is already
    /// pending or the revalidator is closed.
    pub fn revalidate<F>(&self, entry_key: &str, thunk: F)
    where
        F: Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match self.in_flight.entry(entry_key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!("revalidation already pending for {entry_key}");
                return;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        let thunk: RevalidationThunk = Box::new(thunk);
        let strategy = self.strategy.clone();
        let in_flight = self.in_flight.clone();
        let key = entry_key.to_string();
        self.handle.spawn(async move {
            let mut attempt = 0u32;
            while let Some(delay) = strategy.schedule(attempt) {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                match thunk().await {
                    Ok(()) => break,
                    Err(err) => {
                        warn!(
                            "background revalidation of {key} failed \
                             (attempt {attempt}): {err}"
                        );
                        attempt += 1;
                    }
                }
            }
            in_flight.remove(&key);
        });
    }

    /// Stops accepting new revalidations. In-flight tasks run to
    /// completion.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Whether a revalidation for this entry key is currently pending.
    #[must_use]
    pub fn is_pending(&self, entry_key: &str) -> bool {
        self.in_flight.contains_key(entry_key)
    }

    /// Number of revalidations currently pending.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }
}
