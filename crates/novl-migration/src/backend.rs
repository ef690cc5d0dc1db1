//! The backend seam the migration layer routes across: one contract, two
//! implementations (the trusted SQLite store and the candidate in-memory
//! backend being proven against it).

use novl_core::{Translation, TranslationResult, TranslationSettings};
use novl_store::{SessionStore, StoreError};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

pub trait TranslationBackend: Send + Sync {
    fn backend_name(&self) -> &'static str;

    fn store_translation(
        &self,
        stable_id: &str,
        result: &TranslationResult,
        settings: &TranslationSettings,
    ) -> Result<Translation, StoreError>;

    fn versions(&self, stable_id: &str) -> Result<Vec<Translation>, StoreError>;

    fn active(&self, stable_id: &str) -> Result<Option<Translation>, StoreError>;

    fn set_active(&self, stable_id: &str, version: i64) -> Result<(), StoreError>;

    fn delete_version(&self, translation_id: i64) -> Result<(), StoreError>;
}

impl TranslationBackend for SessionStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    fn store_translation(
        &self,
        stable_id: &str,
        result: &TranslationResult,
        settings: &TranslationSettings,
    ) -> Result<Translation, StoreError> {
        self.store_translation_by_stable_id(stable_id, result, settings)
    }

    fn versions(&self, stable_id: &str) -> Result<Vec<Translation>, StoreError> {
        SessionStore::versions(self, stable_id)
    }

    fn active(&self, stable_id: &str) -> Result<Option<Translation>, StoreError> {
        SessionStore::active(self, stable_id)
    }

    fn set_active(&self, stable_id: &str, version: i64) -> Result<(), StoreError> {
        SessionStore::set_active(self, stable_id, version)
    }

    fn delete_version(&self, translation_id: i64) -> Result<(), StoreError> {
        SessionStore::delete_version(self, translation_id)
    }
}

/// Candidate backend: versioned translations held per chapter in memory. It
/// receives dual writes for chapters the trusted backend owns, so an unknown
/// stable id on a write simply starts a new version chain.
#[derive(Default)]
pub struct MemoryBackend {
    chapters: RwLock<BTreeMap<String, Vec<Translation>>>,
    next_id: AtomicI64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, Vec<Translation>>>, StoreError>
    {
        self.chapters
            .read()
            .map_err(|_| StoreError::Transient("memory backend lock poisoned".to_string()))
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, BTreeMap<String, Vec<Translation>>>, StoreError>
    {
        self.chapters
            .write()
            .map_err(|_| StoreError::Transient("memory backend lock poisoned".to_string()))
    }
}

impl TranslationBackend for MemoryBackend {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn store_translation(
        &self,
        stable_id: &str,
        result: &TranslationResult,
        settings: &TranslationSettings,
    ) -> Result<Translation, StoreError> {
        let mut chapters = self.write()?;
        let rows = chapters.entry(stable_id.to_string()).or_default();
        let next_version = rows.iter().map(|t| t.version).max().unwrap_or(0) + 1;
        for row in rows.iter_mut() {
            row.is_active = false;
        }
        let translation = Translation {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            stable_id: stable_id.to_string(),
            version: next_version,
            is_active: true,
            title: result.translated_title.clone(),
            content: result.translation.clone(),
            settings: settings.clone(),
            usage: result.usage.clone(),
            footnotes: result.footnotes.clone(),
            created_at: chrono::Utc::now(),
        };
        rows.push(translation.clone());
        Ok(translation)
    }

    fn versions(&self, stable_id: &str) -> Result<Vec<Translation>, StoreError> {
        let chapters = self.read()?;
        let mut rows = chapters.get(stable_id).cloned().unwrap_or_default();
        rows.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(rows)
    }

    fn active(&self, stable_id: &str) -> Result<Option<Translation>, StoreError> {
        let chapters = self.read()?;
        Ok(chapters
            .get(stable_id)
            .and_then(|rows| rows.iter().find(|t| t.is_active).cloned()))
    }

    fn set_active(&self, stable_id: &str, version: i64) -> Result<(), StoreError> {
        let mut chapters = self.write()?;
        let rows = chapters
            .get_mut(stable_id)
            .ok_or_else(|| StoreError::NotFound(format!("unknown stable id {stable_id}")))?;
        if !rows.iter().any(|t| t.version == version) {
            return Err(StoreError::Constraint(format!(
                "version {version} does not exist for chapter {stable_id}"
            )));
        }
        for row in rows.iter_mut() {
            row.is_active = row.version == version;
        }
        Ok(())
    }

    fn delete_version(&self, translation_id: i64) -> Result<(), StoreError> {
        let mut chapters = self.write()?;
        for rows in chapters.values_mut() {
            if let Some(index) = rows.iter().position(|t| t.id == translation_id) {
                let removed = rows.remove(index);
                if removed.is_active {
                    let top_version = rows.iter().map(|t| t.version).max();
                    if let Some(version) = top_version {
                        if let Some(top) = rows.iter_mut().find(|t| t.version == version) {
                            top.is_active = true;
                        }
                    }
                }
                return Ok(());
            }
        }
        Err(StoreError::NotFound(format!(
            "translation {translation_id} not found"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TranslationSettings {
        TranslationSettings {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            temperature: 0.3,
            prompt_id: "default.v1".to_string(),
        }
    }

    fn result(content: &str) -> TranslationResult {
        TranslationResult {
            translated_title: None,
            translation: content.to_string(),
            usage: None,
            footnotes: Vec::new(),
            suggested_illustrations: Vec::new(),
            proposal: None,
        }
    }

    #[test]
    fn memory_backend_versions_and_single_active() {
        let backend = MemoryBackend::new();
        let v1 = backend
            .store_translation("ch_0123456789ab", &result("one"), &settings())
            .expect("v1");
        let v2 = backend
            .store_translation("ch_0123456789ab", &result("two"), &settings())
            .expect("v2");
        assert_eq!((v1.version, v2.version), (1, 2));

        let rows = backend.versions("ch_0123456789ab").expect("versions");
        assert_eq!(rows.iter().map(|t| t.version).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(rows.iter().filter(|t| t.is_active).count(), 1);

        backend.set_active("ch_0123456789ab", 1).expect("set active");
        let active = backend.active("ch_0123456789ab").expect("active").expect("some");
        assert_eq!(active.version, 1);
    }

    #[test]
    fn memory_backend_delete_promotes_like_the_trusted_store() {
        let backend = MemoryBackend::new();
        backend
            .store_translation("ch_0123456789ab", &result("one"), &settings())
            .expect("v1");
        let v2 = backend
            .store_translation("ch_0123456789ab", &result("two"), &settings())
            .expect("v2");

        backend.delete_version(v2.id).expect("delete active");
        let active = backend.active("ch_0123456789ab").expect("active").expect("some");
        assert_eq!(active.version, 1);

        let err = backend.set_active("ch_0123456789ab", 9).expect_err("bad version");
        assert!(matches!(err, StoreError::Constraint(_)));
    }
}
