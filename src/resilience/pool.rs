//! Health-checked pool of text-generation client handles.
//!
//! Handles are keyed by endpoint. Each endpoint holds at most
//! `max_per_endpoint` handles, idle plus checked out. A handle is retired
//! when its failure count exceeds the threshold or it outlives
//! `max_lifetime`; the sweeper evicts stale idle handles and replaces the
//! ones that aged out.

use crate::agent::client::{ClientFactory, TextGenClient};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pool limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum handles per endpoint, idle plus checked out.
    pub max_per_endpoint: usize,
    /// Handles older than this are retired.
    #[serde(rename = "max_lifetime_ms", with = "crate::config::duration_ms")]
    pub max_lifetime: Duration,
    /// Idle handles unused for this long are evicted by the sweeper.
    #[serde(rename = "idle_timeout_ms", with = "crate::config::duration_ms")]
    pub idle_timeout: Duration,
    /// A handle whose recent failures exceed this count is retired.
    pub failure_threshold: u32,
    /// How often the background sweeper runs.
    #[serde(rename = "sweep_interval_ms", with = "crate::config::duration_ms")]
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_endpoint: 4,
            max_lifetime: Duration::from_secs(600),
            idle_timeout: Duration::from_secs(120),
            failure_threshold: 3,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// How a call made with a pooled handle went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    /// The call neither proved nor disproved the handle's health
    /// (for example a validation error or an abandoned call).
    Neutral,
}

struct PoolEntry {
    id: u64,
    client: Arc<dyn TextGenClient>,
    created_at: Instant,
    last_used_at: Instant,
    recent_failures: u32,
    recent_successes: u32,
}

impl PoolEntry {
    fn aged_out(&self, config: &PoolConfig) -> bool {
        self.created_at.elapsed() >= config.max_lifetime
    }

    fn unhealthy(&self, config: &PoolConfig) -> bool {
        self.recent_failures > config.failure_threshold
    }

    fn idle_too_long(&self, config: &PoolConfig) -> bool {
        self.last_used_at.elapsed() >= config.idle_timeout
    }
}

#[derive(Default)]
struct EndpointSlot {
    idle: Vec<PoolEntry>,
    in_use: usize,
}

impl EndpointSlot {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use
    }
}

struct PoolShared {
    config: PoolConfig,
    factory: Arc<dyn ClientFactory>,
    endpoints: Mutex<HashMap<String, EndpointSlot>>,
    next_id: AtomicU64,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, EndpointSlot>> {
        self.endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn create_entry(&self, endpoint: &str) -> Result<PoolEntry> {
        let client = self.factory.create(endpoint)?;
        let now = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(endpoint, handle = id, "created pooled handle");
        Ok(PoolEntry {
            id,
            client,
            created_at: now,
            last_used_at: now,
            recent_failures: 0,
            recent_successes: 0,
        })
    }

    fn give_back(&self, endpoint: &str, mut entry: PoolEntry, outcome: CallOutcome) {
        match outcome {
            CallOutcome::Success => {
                entry.recent_successes += 1;
                entry.recent_failures = 0;
            }
            CallOutcome::Failure => entry.recent_failures += 1,
            CallOutcome::Neutral => {}
        }
        entry.last_used_at = Instant::now();

        let mut endpoints = self.lock();
        let slot = endpoints.entry(endpoint.to_string()).or_default();
        slot.in_use = slot.in_use.saturating_sub(1);

        if entry.unhealthy(&self.config) {
            warn!(
                endpoint,
                handle = entry.id,
                failures = entry.recent_failures,
                successes = entry.recent_successes,
                "retiring unhealthy handle"
            );
        } else if entry.aged_out(&self.config) {
            debug!(endpoint, handle = entry.id, "retiring handle past max lifetime");
        } else {
            slot.idle.push(entry);
        }
    }
}

/// A handle checked out of the pool.
///
/// Return it with [`ConnectionPool::release`]. Dropping it without
/// releasing returns it with a neutral outcome.
pub struct PooledConnection {
    endpoint: String,
    client: Arc<dyn TextGenClient>,
    entry: Option<PoolEntry>,
    shared: Arc<PoolShared>,
}

impl PooledConnection {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Pool-unique handle id.
    pub fn id(&self) -> u64 {
        self.entry.as_ref().map(|e| e.id).unwrap_or_default()
    }

    /// The underlying client.
    pub fn client(&self) -> &Arc<dyn TextGenClient> {
        &self.client
    }

    fn finish(mut self, outcome: CallOutcome) {
        if let Some(entry) = self.entry.take() {
            self.shared.give_back(&self.endpoint, entry, outcome);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.shared
                .give_back(&self.endpoint, entry, CallOutcome::Neutral);
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("endpoint", &self.endpoint)
            .field("id", &self.id())
            .finish()
    }
}

/// Per-endpoint counts, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SweepReport {
    pub evicted: usize,
    pub recreated: usize,
}

/// Shared pool of client handles. Cloning shares the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl ConnectionPool {
    /// Create a new pool building handles with `factory`.
    pub fn new(config: PoolConfig, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config,
                factory,
                endpoints: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Check out a healthy handle for `endpoint`.
    ///
    /// Reuses the most recently used idle handle, discarding stale ones on
    /// the way, and creates a new handle while below capacity.
    ///
    /// # Errors
    /// - `PoolExhausted` when every handle for the endpoint is checked out
    /// - any error from the client factory
    pub fn acquire(&self, endpoint: &str) -> Result<PooledConnection> {
        let config = &self.shared.config;
        let mut endpoints = self.shared.lock();
        let slot = endpoints.entry(endpoint.to_string()).or_default();

        while let Some(mut entry) = slot.idle.pop() {
            if entry.aged_out(config) || entry.unhealthy(config) {
                debug!(endpoint, handle = entry.id, "discarding stale idle handle");
                continue;
            }
            entry.last_used_at = Instant::now();
            slot.in_use += 1;
            return Ok(self.wrap(endpoint, entry));
        }

        if slot.total() >= config.max_per_endpoint {
            return Err(Error::PoolExhausted {
                endpoint: endpoint.to_string(),
                max: config.max_per_endpoint,
            });
        }

        let entry = self.shared.create_entry(endpoint)?;
        slot.in_use += 1;
        Ok(self.wrap(endpoint, entry))
    }

    /// Return a handle, recording how the call went.
    pub fn release(&self, conn: PooledConnection, outcome: CallOutcome) {
        conn.finish(outcome);
    }

    pub fn stats(&self, endpoint: &str) -> PoolStats {
        self.shared
            .lock()
            .get(endpoint)
            .map(|slot| PoolStats {
                idle: slot.idle.len(),
                in_use: slot.in_use,
            })
            .unwrap_or_default()
    }

    /// Evict stale idle handles and recreate the ones retired for age.
    pub fn sweep(&self) -> SweepReport {
        let config = &self.shared.config;
        let mut report = SweepReport::default();
        let mut endpoints = self.shared.lock();

        for (endpoint, slot) in endpoints.iter_mut() {
            let before = slot.idle.len();
            let mut replace = 0;
            slot.idle.retain(|entry| {
                if entry.aged_out(config) {
                    replace += 1;
                    false
                } else {
                    !(entry.unhealthy(config) || entry.idle_too_long(config))
                }
            });
            report.evicted += before - slot.idle.len();

            for _ in 0..replace {
                if slot.total() >= config.max_per_endpoint {
                    break;
                }
                match self.shared.create_entry(endpoint) {
                    Ok(entry) => {
                        slot.idle.push(entry);
                        report.recreated += 1;
                    }
                    Err(e) => {
                        warn!(endpoint = %endpoint, error = %e, "failed to recreate handle");
                        break;
                    }
                }
            }
        }

        if report.evicted > 0 {
            debug!(
                evicted = report.evicted,
                recreated = report.recreated,
                "pool sweep"
            );
        }
        report
    }

    /// Run [`sweep`](Self::sweep) every `interval` on a background task.
    pub fn spawn_sweeper(&self, interval: Duration) -> SweeperHandle {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let pool = self.clone();

        info!(interval_ms = interval.as_millis() as u64, "starting pool sweeper");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick fires immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        debug!("pool sweeper cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        pool.sweep();
                    }
                }
            }
        });

        SweeperHandle { cancel }
    }

    fn wrap(&self, endpoint: &str, entry: PoolEntry) -> PooledConnection {
        PooledConnection {
            endpoint: endpoint.to_string(),
            client: entry.client.clone(),
            entry: Some(entry),
            shared: self.shared.clone(),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.shared.config)
            .finish()
    }
}

/// Handle to the background sweeper, used for shutdown.
pub struct SweeperHandle {
    cancel: CancellationToken,
}

impl SweeperHandle {
    /// Signal the sweeper to stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
