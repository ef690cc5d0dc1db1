//! Shadow validation: run an operation against the trusted and the candidate
//! backend, compare, keep score, and always hand the trusted result back to
//! the caller.

use crate::{MigrationConfig, ValidationThresholds, DEFAULT_SHADOW_CALL_TIMEOUT};
use novl_core::migration_contracts::ShadowCompare;
use novl_store::StoreError;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Per-service comparison counters. Derived data only, never persisted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ValidationMetrics {
    pub total_operations: u64,
    pub identical_results: u64,
    pub differences: u64,
    pub errors: u64,
}

impl ValidationMetrics {
    pub fn error_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }
        self.errors as f64 / self.total_operations as f64
    }

    pub fn difference_rate(&self) -> f64 {
        if self.total_operations == 0 {
            return 0.0;
        }
        self.differences as f64 / self.total_operations as f64
    }
}

pub struct ShadowValidator {
    thresholds: ValidationThresholds,
    shadow_call_timeout: Duration,
    metrics: Mutex<BTreeMap<String, ValidationMetrics>>,
}

impl Default for ShadowValidator {
    fn default() -> Self {
        Self::new(ValidationThresholds::default(), DEFAULT_SHADOW_CALL_TIMEOUT)
    }
}

impl ShadowValidator {
    pub fn new(thresholds: ValidationThresholds, shadow_call_timeout: Duration) -> Self {
        Self {
            thresholds,
            shadow_call_timeout,
            metrics: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn from_config(config: &MigrationConfig) -> Self {
        Self::new(config.thresholds, config.shadow_call_timeout)
    }

    /// Invoke both implementations and return the trusted (old) result.
    ///
    /// The candidate call runs on its own thread with a bounded wait, so a
    /// hung candidate backend can only cost the timeout, never block the
    /// trusted path indefinitely. Candidate failures, divergences and
    /// timeouts are counted; only a trusted-path failure propagates.
    pub fn validate_read<T, F, G>(
        &self,
        op: &str,
        service: &str,
        old_call: F,
        new_call: G,
    ) -> Result<T, StoreError>
    where
        T: ShadowCompare + Send + 'static,
        F: FnOnce() -> Result<T, StoreError>,
        G: FnOnce() -> Result<T, StoreError> + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        // Detached on purpose: if the candidate hangs past the timeout the
        // send lands in a dropped receiver and the thread exits quietly.
        thread::spawn(move || {
            let _ = sender.send(new_call());
        });

        let old_result = old_call();
        let new_result = receiver.recv_timeout(self.shadow_call_timeout);

        match (&old_result, new_result) {
            (Ok(old), Ok(Ok(new))) => {
                if old.shadow_eq(&new) {
                    self.record(service, |m| m.identical_results += 1);
                    debug!(op, service, "shadow comparison identical");
                } else {
                    self.record(service, |m| m.differences += 1);
                    warn!(op, service, "shadow divergence between backends");
                }
            }
            (Ok(_), Ok(Err(err))) => {
                self.record(service, |m| m.errors += 1);
                warn!(op, service, error = %err, "candidate backend failed during shadow read");
            }
            (Ok(_), Err(RecvTimeoutError::Timeout)) => {
                self.record(service, |m| m.errors += 1);
                warn!(
                    op,
                    service,
                    timeout_ms = self.shadow_call_timeout.as_millis() as u64,
                    "candidate backend timed out during shadow read"
                );
            }
            (Ok(_), Err(RecvTimeoutError::Disconnected)) => {
                self.record(service, |m| m.errors += 1);
                warn!(op, service, "candidate backend dropped its result channel");
            }
            (Err(err), _) => {
                self.record(service, |m| m.errors += 1);
                warn!(op, service, error = %err, "trusted backend failed during shadow read");
            }
        }

        old_result
    }

    pub fn is_service_valid(&self, service: &str) -> bool {
        let snapshot = self.metrics(service);
        snapshot.total_operations >= self.thresholds.min_operations
            && snapshot.error_rate() <= self.thresholds.max_error_rate
            && snapshot.difference_rate() <= self.thresholds.max_difference_rate
    }

    pub fn metrics(&self, service: &str) -> ValidationMetrics {
        self.metrics
            .lock()
            .map(|map| map.get(service).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn reset(&self, service: &str) {
        if let Ok(mut map) = self.metrics.lock() {
            map.remove(service);
        }
    }

    /// Count a candidate-side write failure observed outside a shadow read
    /// (dual-write window).
    pub fn record_error(&self, service: &str) {
        self.record(service, |m| m.errors += 1);
    }

    fn record(&self, service: &str, update: impl FnOnce(&mut ValidationMetrics)) {
        if let Ok(mut map) = self.metrics.lock() {
            let entry = map.entry(service.to_string()).or_default();
            entry.total_operations += 1;
            update(entry);
        }
    }
}
