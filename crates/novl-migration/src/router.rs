//! Routing facade callers use while a migration is in flight. Depending on
//! the service's phase and the explicit routing switches, an operation goes
//! to the trusted backend, to both, or to the candidate — and during
//! shadow/reads phases the candidate only ever runs observationally.

use crate::backend::TranslationBackend;
use crate::validator::ShadowValidator;
use crate::MigrationController;
use novl_core::migration_contracts::MigrationPhase;
use novl_core::{Translation, TranslationResult, TranslationSettings};
use novl_store::StoreError;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadRoute {
    OldOnly,
    Shadowed,
    NewOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteRoute {
    OldOnly,
    Dual,
    NewOnly,
}

pub struct MigratedTranslationService {
    service: String,
    old: Arc<dyn TranslationBackend>,
    new: Arc<dyn TranslationBackend>,
    controller: Arc<MigrationController>,
    validator: Arc<ShadowValidator>,
}

impl MigratedTranslationService {
    pub fn new(
        service: impl Into<String>,
        old: Arc<dyn TranslationBackend>,
        new: Arc<dyn TranslationBackend>,
        controller: Arc<MigrationController>,
        validator: Arc<ShadowValidator>,
    ) -> Self {
        Self {
            service: service.into(),
            old,
            new,
            controller,
            validator,
        }
    }

    fn read_route(&self) -> ReadRoute {
        match self.controller.phase(&self.service) {
            Err(_) => ReadRoute::OldOnly,
            Ok(MigrationPhase::Shadow) | Ok(MigrationPhase::Reads) => ReadRoute::Shadowed,
            Ok(MigrationPhase::DualWrite) => ReadRoute::OldOnly,
            Ok(MigrationPhase::Writes) | Ok(MigrationPhase::Complete) => {
                if self.controller.should_use_new_backend(&self.service) {
                    ReadRoute::NewOnly
                } else {
                    ReadRoute::OldOnly
                }
            }
        }
    }

    fn write_route(&self) -> WriteRoute {
        match self.controller.phase(&self.service) {
            Err(_) | Ok(MigrationPhase::Shadow) | Ok(MigrationPhase::Reads) => WriteRoute::OldOnly,
            Ok(MigrationPhase::DualWrite) => {
                if self.controller.should_use_new_backend(&self.service) {
                    WriteRoute::Dual
                } else {
                    WriteRoute::OldOnly
                }
            }
            Ok(MigrationPhase::Writes) | Ok(MigrationPhase::Complete) => {
                if self.controller.should_use_new_backend(&self.service) {
                    WriteRoute::NewOnly
                } else {
                    WriteRoute::OldOnly
                }
            }
        }
    }

    /// Candidate-side write failure inside the dual-write window: count it,
    /// stay on the trusted result.
    fn note_candidate_failure(&self, op: &str, err: &StoreError) {
        warn!(
            service = %self.service,
            op,
            backend = self.new.backend_name(),
            error = %err,
            "candidate backend failed during dual write"
        );
        self.validator.record_error(&self.service);
        if let Err(record_err) = self.controller.record_error(&self.service, &err.to_string()) {
            warn!(service = %self.service, error = %record_err, "failed to record candidate error");
        }
    }

    pub fn store_translation(
        &self,
        stable_id: &str,
        result: &TranslationResult,
        settings: &TranslationSettings,
    ) -> Result<Translation, StoreError> {
        match self.write_route() {
            WriteRoute::OldOnly => self.old.store_translation(stable_id, result, settings),
            WriteRoute::NewOnly => self.new.store_translation(stable_id, result, settings),
            WriteRoute::Dual => {
                let trusted = self.old.store_translation(stable_id, result, settings)?;
                if let Err(err) = self.new.store_translation(stable_id, result, settings) {
                    self.note_candidate_failure("store_translation", &err);
                }
                Ok(trusted)
            }
        }
    }

    pub fn versions(&self, stable_id: &str) -> Result<Vec<Translation>, StoreError> {
        match self.read_route() {
            ReadRoute::OldOnly => self.old.versions(stable_id),
            ReadRoute::NewOnly => self.new.versions(stable_id),
            ReadRoute::Shadowed => {
                let new = Arc::clone(&self.new);
                let id = stable_id.to_string();
                self.validator.validate_read(
                    "versions",
                    &self.service,
                    || self.old.versions(stable_id),
                    move || new.versions(&id),
                )
            }
        }
    }

    pub fn active(&self, stable_id: &str) -> Result<Option<Translation>, StoreError> {
        match self.read_route() {
            ReadRoute::OldOnly => self.old.active(stable_id),
            ReadRoute::NewOnly => self.new.active(stable_id),
            ReadRoute::Shadowed => {
                let new = Arc::clone(&self.new);
                let id = stable_id.to_string();
                self.validator.validate_read(
                    "active",
                    &self.service,
                    || self.old.active(stable_id),
                    move || new.active(&id),
                )
            }
        }
    }

    pub fn set_active(&self, stable_id: &str, version: i64) -> Result<(), StoreError> {
        match self.write_route() {
            WriteRoute::OldOnly => self.old.set_active(stable_id, version),
            WriteRoute::NewOnly => self.new.set_active(stable_id, version),
            WriteRoute::Dual => {
                self.old.set_active(stable_id, version)?;
                if let Err(err) = self.new.set_active(stable_id, version) {
                    self.note_candidate_failure("set_active", &err);
                }
                Ok(())
            }
        }
    }

    pub fn delete_version(&self, translation_id: i64) -> Result<(), StoreError> {
        match self.write_route() {
            WriteRoute::OldOnly => self.old.delete_version(translation_id),
            WriteRoute::NewOnly => self.new.delete_version(translation_id),
            WriteRoute::Dual => {
                self.old.delete_version(translation_id)?;
                if let Err(err) = self.new.delete_version(translation_id) {
                    self.note_candidate_failure("delete_version", &err);
                }
                Ok(())
            }
        }
    }
}
