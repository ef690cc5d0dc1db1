pub mod backend;
pub mod monitor;
pub mod router;
pub mod validator;

use chrono::Utc;
use novl_core::migration_contracts::{BackendMode, MigrationPhase, MigrationState};
use novl_store::{SessionStore, StoreError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_MIN_OPERATIONS: u64 = 10;
pub const DEFAULT_MAX_ERROR_RATE: f64 = 0.01;
pub const DEFAULT_MAX_DIFFERENCE_RATE: f64 = 0.01;
pub const DEFAULT_MONITOR_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_SHADOW_CALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("invalid phase transition for {service}: {from} -> {to} ({reason})")]
    Constraint {
        service: String,
        from: MigrationPhase,
        to: MigrationPhase,
        reason: String,
    },
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationThresholds {
    pub min_operations: u64,
    pub max_error_rate: f64,
    pub max_difference_rate: f64,
}

impl Default for ValidationThresholds {
    fn default() -> Self {
        Self {
            min_operations: DEFAULT_MIN_OPERATIONS,
            max_error_rate: DEFAULT_MAX_ERROR_RATE,
            max_difference_rate: DEFAULT_MAX_DIFFERENCE_RATE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MigrationConfig {
    pub thresholds: ValidationThresholds,
    pub monitor_window: Duration,
    pub shadow_call_timeout: Duration,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            thresholds: ValidationThresholds::default(),
            monitor_window: DEFAULT_MONITOR_WINDOW,
            shadow_call_timeout: DEFAULT_SHADOW_CALL_TIMEOUT,
        }
    }
}

/// Which validated flag a monitoring window is trying to set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationGate {
    Shadow,
    Reads,
    Writes,
}

impl ValidationGate {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationGate::Shadow => "shadow",
            ValidationGate::Reads => "reads",
            ValidationGate::Writes => "writes",
        }
    }

    /// Phase the service must still be in when the window fires, otherwise
    /// the check is stale and must no-op.
    pub fn expected_phase(&self) -> MigrationPhase {
        match self {
            ValidationGate::Shadow => MigrationPhase::Shadow,
            ValidationGate::Reads => MigrationPhase::Reads,
            ValidationGate::Writes => MigrationPhase::Writes,
        }
    }
}

/// Persistence seam for migration state, implemented by the session store's
/// settings table. Kept as a trait so controller tests can run against any
/// store.
pub trait MigrationStateStore: Send + Sync {
    fn load_state(&self, service: &str) -> Result<Option<MigrationState>, StoreError>;
    fn save_state(&self, state: &MigrationState) -> Result<(), StoreError>;
    fn list_states(&self) -> Result<Vec<MigrationState>, StoreError>;
    fn load_mode(&self) -> Result<BackendMode, StoreError>;
    fn save_mode(&self, mode: BackendMode) -> Result<(), StoreError>;
}

impl MigrationStateStore for SessionStore {
    fn load_state(&self, service: &str) -> Result<Option<MigrationState>, StoreError> {
        self.load_migration_state(service)
    }

    fn save_state(&self, state: &MigrationState) -> Result<(), StoreError> {
        self.save_migration_state(state)
    }

    fn list_states(&self) -> Result<Vec<MigrationState>, StoreError> {
        self.list_migration_states()
    }

    fn load_mode(&self) -> Result<BackendMode, StoreError> {
        self.load_backend_mode()
    }

    fn save_mode(&self, mode: BackendMode) -> Result<(), StoreError> {
        self.save_backend_mode(mode)
    }
}

/// Per-service rollout state machine. An explicit context object owned by
/// the application root; nothing here is a process-wide singleton, so tests
/// run as many isolated controllers as they like.
pub struct MigrationController {
    store: Arc<dyn MigrationStateStore>,
    states: Mutex<BTreeMap<String, MigrationState>>,
    mode: Mutex<BackendMode>,
    /// Bumped on every phase change and rollback; scheduled monitoring
    /// windows capture it and no-op if it moved underneath them.
    generation: AtomicU64,
}

impl MigrationController {
    pub fn new(store: Arc<dyn MigrationStateStore>) -> Result<Self, MigrationError> {
        let mut states = BTreeMap::new();
        for state in store.list_states()? {
            states.insert(state.service.clone(), state);
        }
        let mode = store.load_mode()?;
        Ok(Self {
            store,
            states: Mutex::new(states),
            mode: Mutex::new(mode),
            generation: AtomicU64::new(0),
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn lock_states(
        &self,
    ) -> Result<MutexGuard<'_, BTreeMap<String, MigrationState>>, MigrationError> {
        self.states
            .lock()
            .map_err(|_| StoreError::Transient("controller state lock poisoned".to_string()).into())
    }

    /// Begin (or resume) the shadow phase for a service. Idempotent: an
    /// already-tracked service keeps its current state.
    pub fn start_shadow_reads(&self, service: &str) -> Result<MigrationState, MigrationError> {
        let mut states = self.lock_states()?;
        if let Some(existing) = states.get(service) {
            return Ok(existing.clone());
        }
        let state = MigrationState::new(service, Utc::now());
        self.store.save_state(&state)?;
        states.insert(service.to_string(), state.clone());
        info!(service, "started shadow reads");
        Ok(state)
    }

    pub fn mark_validated(
        &self,
        service: &str,
        gate: ValidationGate,
    ) -> Result<MigrationState, MigrationError> {
        let mut states = self.lock_states()?;
        let state = states
            .get_mut(service)
            .ok_or_else(|| MigrationError::UnknownService(service.to_string()))?;
        match gate {
            ValidationGate::Shadow => state.shadow_validated = true,
            ValidationGate::Reads => state.reads_validated = true,
            ValidationGate::Writes => state.writes_validated = true,
        }
        state.updated_at = Utc::now();
        self.store.save_state(state)?;
        info!(service, gate = gate.as_str(), "validation gate passed");
        Ok(state.clone())
    }

    pub fn enable_reads(&self, service: &str) -> Result<MigrationState, MigrationError> {
        self.transition(
            service,
            MigrationPhase::Shadow,
            MigrationPhase::Reads,
            |state| {
                if state.shadow_validated {
                    Ok(())
                } else {
                    Err("shadow phase not validated".to_string())
                }
            },
        )
    }

    pub fn enable_dual_writes(&self, service: &str) -> Result<MigrationState, MigrationError> {
        self.transition(
            service,
            MigrationPhase::Reads,
            MigrationPhase::DualWrite,
            |state| {
                if state.reads_validated {
                    Ok(())
                } else {
                    Err("reads phase not validated".to_string())
                }
            },
        )
    }

    /// Explicit operator action: dual-write ran clean, writes now target the
    /// candidate backend only. No validated flag gates this one.
    pub fn enable_writes(&self, service: &str) -> Result<MigrationState, MigrationError> {
        self.transition(
            service,
            MigrationPhase::DualWrite,
            MigrationPhase::Writes,
            |_| Ok(()),
        )
    }

    pub fn complete_migration(&self, service: &str) -> Result<MigrationState, MigrationError> {
        self.transition(
            service,
            MigrationPhase::Writes,
            MigrationPhase::Complete,
            |state| {
                if state.writes_validated {
                    Ok(())
                } else {
                    Err("writes phase not validated".to_string())
                }
            },
        )
    }

    fn transition(
        &self,
        service: &str,
        from: MigrationPhase,
        to: MigrationPhase,
        gate: impl Fn(&MigrationState) -> Result<(), String>,
    ) -> Result<MigrationState, MigrationError> {
        let mut states = self.lock_states()?;
        let state = states
            .get_mut(service)
            .ok_or_else(|| MigrationError::UnknownService(service.to_string()))?;
        if state.phase != from {
            return Err(MigrationError::Constraint {
                service: service.to_string(),
                from: state.phase,
                to,
                reason: format!("transition requires phase {from}"),
            });
        }
        if let Err(reason) = gate(state) {
            return Err(MigrationError::Constraint {
                service: service.to_string(),
                from,
                to,
                reason,
            });
        }
        state.phase = to;
        state.updated_at = Utc::now();
        self.store.save_state(state)?;
        self.bump_generation();
        info!(service, from = %from, to = %to, "advanced migration phase");
        Ok(state.clone())
    }

    /// Flip the explicit routing switch for a service. Validation and phase
    /// progress never route traffic on their own.
    pub fn enable_service(&self, service: &str) -> Result<MigrationState, MigrationError> {
        let mut states = self.lock_states()?;
        let state = states
            .get_mut(service)
            .ok_or_else(|| MigrationError::UnknownService(service.to_string()))?;
        state.enabled = true;
        state.updated_at = Utc::now();
        self.store.save_state(state)?;
        info!(service, "service routing enabled");
        Ok(state.clone())
    }

    pub fn record_error(&self, service: &str, message: &str) -> Result<(), MigrationError> {
        let mut states = self.lock_states()?;
        let state = states
            .get_mut(service)
            .ok_or_else(|| MigrationError::UnknownService(service.to_string()))?;
        state.error_count += 1;
        state.last_error = Some(message.to_string());
        state.updated_at = Utc::now();
        self.store.save_state(state)?;
        Ok(())
    }

    pub fn rollback_service(&self, service: &str) -> Result<MigrationState, MigrationError> {
        let mut states = self.lock_states()?;
        let state = states
            .get_mut(service)
            .ok_or_else(|| MigrationError::UnknownService(service.to_string()))?;
        state.reset(Utc::now());
        self.store.save_state(state)?;
        self.bump_generation();
        warn!(service, "rolled back migration to shadow");
        Ok(state.clone())
    }

    /// Reset every tracked service and force the global selector back to the
    /// original backend.
    pub fn emergency_rollback(&self) -> Result<(), MigrationError> {
        {
            let mut states = self.lock_states()?;
            let now = Utc::now();
            for state in states.values_mut() {
                state.reset(now);
                self.store.save_state(state)?;
            }
        }
        self.set_backend(BackendMode::Legacy)?;
        self.bump_generation();
        warn!("emergency rollback: all services back to shadow, legacy backend forced");
        Ok(())
    }

    pub fn set_backend(&self, mode: BackendMode) -> Result<(), MigrationError> {
        self.store.save_mode(mode)?;
        let mut cached = self
            .mode
            .lock()
            .map_err(|_| StoreError::Transient("controller mode lock poisoned".to_string()))?;
        *cached = mode;
        info!(mode = %mode, "set global backend mode");
        Ok(())
    }

    pub fn backend_mode(&self) -> BackendMode {
        self.mode
            .lock()
            .map(|mode| *mode)
            .unwrap_or(BackendMode::Legacy)
    }

    /// `false` whenever the global mode is legacy; otherwise only if the
    /// service was explicitly enabled.
    pub fn should_use_new_backend(&self, service: &str) -> bool {
        if self.backend_mode() == BackendMode::Legacy {
            return false;
        }
        self.lock_states()
            .ok()
            .and_then(|states| states.get(service).map(|state| state.enabled))
            .unwrap_or(false)
    }

    pub fn phase(&self, service: &str) -> Result<MigrationPhase, MigrationError> {
        let states = self.lock_states()?;
        states
            .get(service)
            .map(|state| state.phase)
            .ok_or_else(|| MigrationError::UnknownService(service.to_string()))
    }

    pub fn state(&self, service: &str) -> Result<MigrationState, MigrationError> {
        let states = self.lock_states()?;
        states
            .get(service)
            .cloned()
            .ok_or_else(|| MigrationError::UnknownService(service.to_string()))
    }

    pub fn migration_status(&self) -> Result<BTreeMap<String, MigrationState>, MigrationError> {
        Ok(self.lock_states()?.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERVICE: &str = "translations";

    fn controller() -> Arc<MigrationController> {
        let store = Arc::new(SessionStore::open_in_memory().expect("open store"));
        Arc::new(MigrationController::new(store).expect("controller"))
    }

    fn walk_to(controller: &MigrationController, target: MigrationPhase) {
        controller.start_shadow_reads(SERVICE).expect("start");
        if target == MigrationPhase::Shadow {
            return;
        }
        controller
            .mark_validated(SERVICE, ValidationGate::Shadow)
            .expect("shadow gate");
        controller.enable_reads(SERVICE).expect("reads");
        if target == MigrationPhase::Reads {
            return;
        }
        controller
            .mark_validated(SERVICE, ValidationGate::Reads)
            .expect("reads gate");
        controller.enable_dual_writes(SERVICE).expect("dualwrite");
        if target == MigrationPhase::DualWrite {
            return;
        }
        controller.enable_writes(SERVICE).expect("writes");
        if target == MigrationPhase::Writes {
            return;
        }
        controller
            .mark_validated(SERVICE, ValidationGate::Writes)
            .expect("writes gate");
        controller.complete_migration(SERVICE).expect("complete");
    }

    #[test]
    fn phases_advance_strictly_in_order_once_gated() {
        let controller = controller();
        walk_to(&controller, MigrationPhase::Complete);
        assert_eq!(
            controller.phase(SERVICE).expect("phase"),
            MigrationPhase::Complete
        );
    }

    #[test]
    fn enable_reads_before_shadow_validation_is_a_constraint() {
        let controller = controller();
        controller.start_shadow_reads(SERVICE).expect("start");
        let err = controller.enable_reads(SERVICE).expect_err("must fail");
        assert!(matches!(err, MigrationError::Constraint { .. }), "got {err:?}");
        assert_eq!(
            controller.phase(SERVICE).expect("phase"),
            MigrationPhase::Shadow,
            "failed gate must not mutate phase"
        );
    }

    #[test]
    fn skipping_a_phase_is_rejected() {
        let controller = controller();
        controller.start_shadow_reads(SERVICE).expect("start");
        controller
            .mark_validated(SERVICE, ValidationGate::Shadow)
            .expect("gate");
        let err = controller
            .enable_dual_writes(SERVICE)
            .expect_err("cannot jump shadow -> dualwrite");
        assert!(matches!(err, MigrationError::Constraint { .. }));
    }

    #[test]
    fn rollback_resets_fully_from_any_phase() {
        for target in [
            MigrationPhase::Shadow,
            MigrationPhase::Reads,
            MigrationPhase::DualWrite,
            MigrationPhase::Writes,
            MigrationPhase::Complete,
        ] {
            let controller = controller();
            walk_to(&controller, target);
            controller.enable_service(SERVICE).expect("enable");

            let state = controller.rollback_service(SERVICE).expect("rollback");
            assert_eq!(state.phase, MigrationPhase::Shadow, "from {target}");
            assert!(!state.shadow_validated);
            assert!(!state.reads_validated);
            assert!(!state.writes_validated);
            assert!(!state.enabled);
        }
    }

    #[test]
    fn unknown_service_is_its_own_error() {
        let controller = controller();
        let err = controller.enable_reads("ghost").expect_err("unknown");
        assert!(matches!(err, MigrationError::UnknownService(_)));
    }

    #[test]
    fn routing_needs_mode_and_explicit_enable() {
        let controller = controller();
        walk_to(&controller, MigrationPhase::Writes);
        assert!(
            !controller.should_use_new_backend(SERVICE),
            "legacy mode pins the old backend regardless of phase"
        );

        controller
            .set_backend(BackendMode::Migrating)
            .expect("set mode");
        assert!(
            !controller.should_use_new_backend(SERVICE),
            "phase progress alone must not route traffic"
        );

        controller.enable_service(SERVICE).expect("enable");
        assert!(controller.should_use_new_backend(SERVICE));
    }

    #[test]
    fn emergency_rollback_resets_everything_and_forces_legacy() {
        let controller = controller();
        walk_to(&controller, MigrationPhase::Writes);
        controller.enable_service(SERVICE).expect("enable");
        controller
            .set_backend(BackendMode::Migrating)
            .expect("set mode");
        controller.start_shadow_reads("chapters").expect("second service");

        controller.emergency_rollback().expect("emergency rollback");

        assert_eq!(controller.backend_mode(), BackendMode::Legacy);
        for (_, state) in controller.migration_status().expect("status") {
            assert_eq!(state.phase, MigrationPhase::Shadow);
            assert!(!state.enabled);
        }
        assert!(!controller.should_use_new_backend(SERVICE));
    }

    #[test]
    fn state_survives_a_controller_restart() {
        let store = Arc::new(SessionStore::open_in_memory().expect("open store"));
        {
            let controller =
                MigrationController::new(Arc::clone(&store) as Arc<dyn MigrationStateStore>)
                    .expect("controller");
            controller.start_shadow_reads(SERVICE).expect("start");
            controller
                .mark_validated(SERVICE, ValidationGate::Shadow)
                .expect("gate");
            controller.enable_reads(SERVICE).expect("reads");
        }
        let reloaded = MigrationController::new(store).expect("second controller");
        assert_eq!(
            reloaded.phase(SERVICE).expect("phase"),
            MigrationPhase::Reads
        );
    }

    #[test]
    fn phase_changes_and_rollbacks_move_the_generation() {
        let controller = controller();
        let start = controller.generation();
        controller.start_shadow_reads(SERVICE).expect("start");
        controller
            .mark_validated(SERVICE, ValidationGate::Shadow)
            .expect("gate");
        controller.enable_reads(SERVICE).expect("reads");
        let after_advance = controller.generation();
        assert!(after_advance > start);

        controller.rollback_service(SERVICE).expect("rollback");
        assert!(controller.generation() > after_advance);
    }
}
