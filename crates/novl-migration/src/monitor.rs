//! Monitoring windows for validation gates. Each scheduled check is a
//! cancellable timer; a check that fires after the world moved on re-verifies
//! phase and generation and quietly does nothing.

use crate::validator::ShadowValidator;
use crate::{MigrationController, ValidationGate};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

struct MonitorShared {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

pub struct MonitorHandle {
    shared: Arc<MonitorShared>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Cancel the pending check and wait for the timer thread to exit.
    pub fn cancel(mut self) {
        {
            let mut cancelled = match self.shared.cancelled.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *cancelled = true;
        }
        self.shared.signal.notify_all();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Let the window run to completion (test and shutdown paths).
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Schedule one validation check for `service` to fire after `window`.
///
/// When the window elapses the check re-verifies that the controller
/// generation and the service phase still match what was captured at
/// scheduling time; if either moved the check is stale and no-ops. A fired
/// check either marks the gate validated or — the only automatic rollback
/// path in the system — rolls the service back to shadow.
pub fn schedule_validation_check(
    controller: Arc<MigrationController>,
    validator: Arc<ShadowValidator>,
    service: impl Into<String>,
    gate: ValidationGate,
    window: Duration,
) -> MonitorHandle {
    let service = service.into();
    let shared = Arc::new(MonitorShared {
        cancelled: Mutex::new(false),
        signal: Condvar::new(),
    });
    let scheduled_generation = controller.generation();
    let thread_shared = Arc::clone(&shared);

    let thread = thread::spawn(move || {
        let was_cancelled = {
            let guard = match thread_shared.cancelled.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match thread_shared
                .signal
                .wait_timeout_while(guard, window, |cancelled| !*cancelled)
            {
                Ok((guard, _)) => *guard,
                Err(poisoned) => *poisoned.into_inner().0,
            }
        };
        if was_cancelled {
            debug!(%service, gate = gate.as_str(), "validation check cancelled");
            return;
        }

        if controller.generation() != scheduled_generation {
            debug!(
                %service,
                gate = gate.as_str(),
                "validation check stale (generation moved), skipping"
            );
            return;
        }
        let phase = match controller.phase(&service) {
            Ok(phase) => phase,
            Err(err) => {
                debug!(%service, error = %err, "validation check found no service, skipping");
                return;
            }
        };
        if phase != gate.expected_phase() {
            debug!(
                %service,
                gate = gate.as_str(),
                phase = %phase,
                "validation check stale (phase moved), skipping"
            );
            return;
        }

        if validator.is_service_valid(&service) {
            if let Err(err) = controller.mark_validated(&service, gate) {
                warn!(%service, error = %err, "failed to record passed validation gate");
            }
        } else {
            warn!(
                %service,
                gate = gate.as_str(),
                "validation window failed, rolling service back"
            );
            if let Err(err) = controller.rollback_service(&service) {
                warn!(%service, error = %err, "automatic rollback failed");
            }
        }
    });

    MonitorHandle {
        shared,
        thread: Some(thread),
    }
}
