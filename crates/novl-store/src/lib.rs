use chrono::{DateTime, Utc};
use novl_core::migration_contracts::{BackendMode, MigrationState};
use novl_core::{
    generate_stable_id, is_stable_id_shape, normalize_url, ChapterRecord, ChapterRef, NewChapter,
    Translation, TranslationResult, TranslationSettings, UrlMapping,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const SESSION_SCHEMA_VERSION: i64 = 1;

const MIGRATION_KEY_PREFIX: &str = "migration:";
const BACKEND_MODE_KEY: &str = "backend_mode";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("timestamp parse error: {0}")]
    Timestamp(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub chapters_scanned: usize,
    pub mappings_created: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub duplicates_removed: usize,
    pub chapters_repaired: usize,
}

/// SQLite-backed session store: chapter identity, versioned translations and
/// persisted migration state.
///
/// The connection sits behind a mutex so the store is shareable across
/// threads; every mutation that spans a read-modify-write runs inside one
/// IMMEDIATE transaction under that lock, which is what makes version
/// assignment and the active-flag flip a single atomic unit per chapter.
pub struct SessionStore {
    conn: Mutex<Connection>,
}

impl SessionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        schema_version(&conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Transient("connection mutex poisoned".to_string()))
    }

    // --- identity resolver ---

    /// Resolve any chapter address to its stable id: exact URL match, then
    /// normalized URL match, then the input taken as a literal stable id.
    /// A stable-id reference whose mapping rows went missing triggers a
    /// scoped self-heal for that one chapter before failing.
    pub fn resolve(&self, chapter_ref: &ChapterRef) -> Result<String, StoreError> {
        match chapter_ref {
            ChapterRef::Url(url) => {
                let conn = self.lock()?;
                resolve_url_with_conn(&conn, url)?
                    .ok_or_else(|| StoreError::NotFound(format!("no chapter for url {url}")))
            }
            ChapterRef::StableId(id) => {
                let mut conn = self.lock()?;
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let resolved = resolve_stable_id_tx(&tx, id)?;
                tx.commit()?;
                resolved.ok_or_else(|| StoreError::NotFound(format!("unknown stable id {id}")))
            }
        }
    }

    /// Idempotent upsert of one URL mapping. `canonical = true` demotes any
    /// previous canonical mapping and moves the chapter's canonical URL in
    /// the same transaction.
    pub fn ensure_mapping(
        &self,
        url: &str,
        stable_id: &str,
        canonical: bool,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if chapter_tx(&tx, stable_id)?.is_none() {
            return Err(StoreError::NotFound(format!(
                "unknown stable id {stable_id}"
            )));
        }
        ensure_mapping_tx(&tx, url, stable_id, canonical, now)?;
        let normalized = normalize_url(url);
        if normalized != url {
            ensure_mapping_tx(&tx, &normalized, stable_id, false, now)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Point a chapter at a new authoritative URL. Historical mappings are
    /// kept so old URLs keep resolving.
    pub fn set_canonical_url(&self, stable_id: &str, url: &str) -> Result<(), StoreError> {
        self.ensure_mapping(url, stable_id, true)
    }

    /// Full-scan self-heal: recreate a canonical mapping for every chapter
    /// that lost all of its mapping rows. Safe to run repeatedly.
    pub fn backfill_url_mappings(&self) -> Result<BackfillReport, StoreError> {
        let now = Utc::now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let chapters_scanned: i64 =
            tx.query_row("SELECT COUNT(*) FROM chapters", [], |row| row.get(0))?;

        let orphaned: Vec<String> = {
            let mut stmt = tx.prepare(
                "
                SELECT c.stable_id
                FROM chapters c
                WHERE NOT EXISTS (
                    SELECT 1 FROM url_mappings m WHERE m.stable_id = c.stable_id
                )
                ORDER BY c.stable_id
                ",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        let mut mappings_created = 0usize;
        for stable_id in &orphaned {
            mappings_created += backfill_chapter_tx(&tx, stable_id, now)?;
        }
        tx.commit()?;

        if mappings_created > 0 {
            info!(mappings_created, "backfilled url mappings from chapters");
        }
        Ok(BackfillReport {
            chapters_scanned: chapters_scanned as usize,
            mappings_created,
        })
    }

    pub fn chapter(&self, stable_id: &str) -> Result<Option<ChapterRecord>, StoreError> {
        let conn = self.lock()?;
        chapter_tx(&conn, stable_id)
    }

    pub fn url_mappings(&self, stable_id: &str) -> Result<Vec<UrlMapping>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT url, stable_id, is_canonical
            FROM url_mappings
            WHERE stable_id = ?1
            ORDER BY is_canonical DESC, url ASC
            ",
        )?;
        let rows = stmt.query_map([stable_id], |row| {
            Ok(UrlMapping {
                url: row.get(0)?,
                stable_id: row.get(1)?,
                is_canonical: row.get::<_, i64>(2)? != 0,
            })
        })?;
        let mut mappings = Vec::new();
        for row in rows {
            mappings.push(row?);
        }
        Ok(mappings)
    }

    // --- chapters ---

    /// Resolve-or-create a chapter for a URL. Existing chapters keep their
    /// stable id; a fresh chapter gets a canonical mapping for the URL as
    /// given plus a non-canonical one for its normalized spelling.
    pub fn store_chapter(&self, chapter: &NewChapter) -> Result<ChapterRecord, StoreError> {
        let now = Utc::now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let record = match resolve_url_with_conn(&tx, &chapter.url)? {
            Some(stable_id) => {
                if let Some(number) = chapter.chapter_number {
                    tx.execute(
                        "UPDATE chapters SET chapter_number = ?2, updated_at = ?3 WHERE stable_id = ?1",
                        params![stable_id, number, now.to_rfc3339()],
                    )?;
                }
                chapter_tx(&tx, &stable_id)?.ok_or_else(|| {
                    StoreError::Constraint(format!(
                        "mapping points at missing chapter {stable_id}"
                    ))
                })?
            }
            None => create_chapter_tx(&tx, &chapter.url, chapter.chapter_number, now)?,
        };
        tx.commit()?;
        Ok(record)
    }

    // --- translation store ---

    /// Persist one translation attempt. Version assignment and demoting all
    /// other versions happen inside one transaction, so two concurrent calls
    /// for the same chapter always get distinct versions and leave exactly
    /// one active row.
    pub fn store_translation(
        &self,
        chapter_ref: &ChapterRef,
        result: &TranslationResult,
        settings: &TranslationSettings,
    ) -> Result<Translation, StoreError> {
        let now = Utc::now();
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stable_id = match chapter_ref {
            ChapterRef::Url(url) => match resolve_url_with_conn(&tx, url)? {
                Some(id) => id,
                None => create_chapter_tx(&tx, url, None, now)?.stable_id,
            },
            ChapterRef::StableId(id) => resolve_stable_id_tx(&tx, id)?
                .ok_or_else(|| StoreError::NotFound(format!("unknown stable id {id}")))?,
        };
        let translation = insert_translation_tx(&tx, &stable_id, result, settings, now)?;
        tx.commit()?;
        info!(
            stable_id = %translation.stable_id,
            version = translation.version,
            "stored translation version"
        );
        Ok(translation)
    }

    pub fn store_translation_by_stable_id(
        &self,
        stable_id: &str,
        result: &TranslationResult,
        settings: &TranslationSettings,
    ) -> Result<Translation, StoreError> {
        self.store_translation(&ChapterRef::stable_id(stable_id), result, settings)
    }

    /// All versions for a chapter, newest version first.
    pub fn versions(&self, stable_id: &str) -> Result<Vec<Translation>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "
            SELECT id, stable_id, version, is_active, title, content,
                   settings_json, usage_json, footnotes_json, created_at
            FROM translations
            WHERE stable_id = ?1
            ORDER BY version DESC
            ",
        )?;
        let rows = stmt.query_map([stable_id], translation_from_row)?;
        let mut translations = Vec::new();
        for row in rows {
            translations.push(row?);
        }
        Ok(translations)
    }

    pub fn active(&self, stable_id: &str) -> Result<Option<Translation>, StoreError> {
        let conn = self.lock()?;
        let translation = conn
            .query_row(
                "
                SELECT id, stable_id, version, is_active, title, content,
                       settings_json, usage_json, footnotes_json, created_at
                FROM translations
                WHERE stable_id = ?1 AND is_active = 1
                LIMIT 1
                ",
                [stable_id],
                translation_from_row,
            )
            .optional()?;
        Ok(translation)
    }

    /// Atomically make `version` the active one for a chapter.
    pub fn set_active(&self, stable_id: &str, version: i64) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if chapter_tx(&tx, stable_id)?.is_none() {
            return Err(StoreError::NotFound(format!(
                "unknown stable id {stable_id}"
            )));
        }
        let exists: Option<i64> = tx
            .query_row(
                "SELECT id FROM translations WHERE stable_id = ?1 AND version = ?2",
                params![stable_id, version],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::Constraint(format!(
                "version {version} does not exist for chapter {stable_id}"
            )));
        }
        tx.execute(
            "
            UPDATE translations
            SET is_active = CASE WHEN version = ?2 THEN 1 ELSE 0 END
            WHERE stable_id = ?1
            ",
            params![stable_id, version],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Delete one translation row. Deleting the active version promotes the
    /// highest remaining version; deleting the last version leaves the
    /// chapter without an active translation.
    pub fn delete_version(&self, translation_id: i64) -> Result<(), StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let row: Option<(String, bool)> = tx
            .query_row(
                "SELECT stable_id, is_active FROM translations WHERE id = ?1",
                [translation_id],
                |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)),
            )
            .optional()?;
        let (stable_id, was_active) = row.ok_or_else(|| {
            StoreError::NotFound(format!("translation {translation_id} not found"))
        })?;

        tx.execute("DELETE FROM translations WHERE id = ?1", [translation_id])?;

        if was_active {
            let promote: Option<i64> = tx
                .query_row(
                    "SELECT id FROM translations WHERE stable_id = ?1 ORDER BY version DESC LIMIT 1",
                    [stable_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(promote_id) = promote {
                tx.execute(
                    "
                    UPDATE translations
                    SET is_active = CASE WHEN id = ?2 THEN 1 ELSE 0 END
                    WHERE stable_id = ?1
                    ",
                    params![stable_id, promote_id],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // --- URL-addressed convenience surface ---

    pub fn versions_by_url(&self, url: &str) -> Result<Vec<Translation>, StoreError> {
        let stable_id = self.resolve(&ChapterRef::url(url))?;
        self.versions(&stable_id)
    }

    pub fn active_by_url(&self, url: &str) -> Result<Option<Translation>, StoreError> {
        let stable_id = self.resolve(&ChapterRef::url(url))?;
        self.active(&stable_id)
    }

    pub fn set_active_by_url(&self, url: &str, version: i64) -> Result<(), StoreError> {
        let stable_id = self.resolve(&ChapterRef::url(url))?;
        self.set_active(&stable_id, version)
    }

    // --- maintenance ---

    /// Remove duplicate `(stable_id, version)` rows left behind by older
    /// storage generations (the current schema forbids new ones), keeping the
    /// newest row of each pair, then re-assert the single-active invariant
    /// for every chapter that has translations.
    pub fn cleanup_duplicate_versions(&self) -> Result<CleanupReport, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let dupes: Vec<(String, i64)> = {
            let mut stmt = tx.prepare(
                "
                SELECT stable_id, version
                FROM translations
                GROUP BY stable_id, version
                HAVING COUNT(*) > 1
                ",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let mut pairs = Vec::new();
            for row in rows {
                pairs.push(row?);
            }
            pairs
        };

        let mut duplicates_removed = 0usize;
        for (stable_id, version) in &dupes {
            duplicates_removed += tx.execute(
                "
                DELETE FROM translations
                WHERE stable_id = ?1 AND version = ?2
                  AND id <> (
                    SELECT MAX(id) FROM translations WHERE stable_id = ?1 AND version = ?2
                  )
                ",
                params![stable_id, version],
            )?;
        }

        let broken: Vec<String> = {
            let mut stmt = tx.prepare(
                "
                SELECT stable_id
                FROM translations
                GROUP BY stable_id
                HAVING SUM(is_active) <> 1
                ",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        let mut chapters_repaired = 0usize;
        for stable_id in &broken {
            let top: i64 = tx.query_row(
                "SELECT id FROM translations WHERE stable_id = ?1 ORDER BY version DESC LIMIT 1",
                [stable_id.as_str()],
                |row| row.get(0),
            )?;
            tx.execute(
                "
                UPDATE translations
                SET is_active = CASE WHEN id = ?2 THEN 1 ELSE 0 END
                WHERE stable_id = ?1
                ",
                params![stable_id, top],
            )?;
            chapters_repaired += 1;
            warn!(stable_id = %stable_id, "repaired active-version invariant");
        }

        tx.commit()?;
        Ok(CleanupReport {
            duplicates_removed,
            chapters_repaired,
        })
    }

    // --- migration state persistence ---

    pub fn load_migration_state(
        &self,
        service: &str,
    ) -> Result<Option<MigrationState>, StoreError> {
        let conn = self.lock()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                [migration_key(service)],
                |row| row.get(0),
            )
            .optional()?;
        value
            .map(|json| {
                serde_json::from_str(&json)
                    .map_err(|err| StoreError::Serialization(err.to_string()))
            })
            .transpose()
    }

    pub fn save_migration_state(&self, state: &MigrationState) -> Result<(), StoreError> {
        let json = serde_json::to_string(state)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        let conn = self.lock()?;
        conn.execute(
            "
            INSERT INTO settings (key, value_json) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json
            ",
            params![migration_key(&state.service), json],
        )?;
        Ok(())
    }

    pub fn list_migration_states(&self) -> Result<Vec<MigrationState>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT value_json FROM settings WHERE key LIKE ?1 ORDER BY key",
        )?;
        let pattern = format!("{MIGRATION_KEY_PREFIX}%");
        let rows = stmt.query_map([pattern], |row| row.get::<_, String>(0))?;
        let mut states = Vec::new();
        for row in rows {
            let json = row?;
            states.push(
                serde_json::from_str(&json)
                    .map_err(|err| StoreError::Serialization(err.to_string()))?,
            );
        }
        Ok(states)
    }

    pub fn load_backend_mode(&self) -> Result<BackendMode, StoreError> {
        let conn = self.lock()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                [BACKEND_MODE_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            Some(json) => serde_json::from_str(&json)
                .map_err(|err| StoreError::Serialization(err.to_string())),
            None => Ok(BackendMode::Legacy),
        }
    }

    pub fn save_backend_mode(&self, mode: BackendMode) -> Result<(), StoreError> {
        let json = serde_json::to_string(&mode)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        let conn = self.lock()?;
        conn.execute(
            "
            INSERT INTO settings (key, value_json) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json
            ",
            params![BACKEND_MODE_KEY, json],
        )?;
        Ok(())
    }
}

fn migration_key(service: &str) -> String {
    format!("{MIGRATION_KEY_PREFIX}{service}")
}

fn schema_version(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let current = schema_version(conn)?;
    if current > SESSION_SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchemaVersion {
            found: current,
            supported: SESSION_SCHEMA_VERSION,
        });
    }

    if current < 1 {
        let sql = include_str!("../migrations/0001_session_schema.sql");
        conn.execute_batch(sql)?;
        conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
    }

    Ok(())
}

fn resolve_url_with_conn(conn: &Connection, url: &str) -> Result<Option<String>, StoreError> {
    let direct: Option<String> = conn
        .query_row(
            "SELECT stable_id FROM url_mappings WHERE url = ?1",
            [url],
            |row| row.get(0),
        )
        .optional()?;
    if direct.is_some() {
        return Ok(direct);
    }

    let normalized = normalize_url(url);
    if normalized != url {
        let by_normalized: Option<String> = conn
            .query_row(
                "SELECT stable_id FROM url_mappings WHERE url = ?1",
                [normalized.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if by_normalized.is_some() {
            return Ok(by_normalized);
        }
    }

    if is_stable_id_shape(url) && chapter_tx(conn, url)?.is_some() {
        return Ok(Some(url.to_string()));
    }

    Ok(None)
}

/// Stable-id resolution with the scoped self-heal: if the chapter exists but
/// has no mapping rows, rebuild them from the chapter record before
/// answering.
fn resolve_stable_id_tx(
    conn: &Connection,
    stable_id: &str,
) -> Result<Option<String>, StoreError> {
    if chapter_tx(conn, stable_id)?.is_none() {
        return Ok(None);
    }
    let mapping_count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM url_mappings WHERE stable_id = ?1",
        [stable_id],
        |row| row.get(0),
    )?;
    if mapping_count == 0 {
        let created = backfill_chapter_tx(conn, stable_id, Utc::now())?;
        debug!(stable_id, created, "self-healed missing url mappings");
    }
    Ok(Some(stable_id.to_string()))
}

fn chapter_tx(conn: &Connection, stable_id: &str) -> Result<Option<ChapterRecord>, StoreError> {
    let record = conn
        .query_row(
            "
            SELECT stable_id, canonical_url, chapter_number, created_at, updated_at
            FROM chapters
            WHERE stable_id = ?1
            ",
            [stable_id],
            |row| {
                let created_at = parse_timestamp_sql(row.get::<_, String>(3)?, 3)?;
                let updated_at = parse_timestamp_sql(row.get::<_, String>(4)?, 4)?;
                Ok(ChapterRecord {
                    stable_id: row.get(0)?,
                    canonical_url: row.get(1)?,
                    chapter_number: row.get(2)?,
                    created_at,
                    updated_at,
                })
            },
        )
        .optional()?;
    Ok(record)
}

fn create_chapter_tx(
    conn: &Connection,
    url: &str,
    chapter_number: Option<i64>,
    now: DateTime<Utc>,
) -> Result<ChapterRecord, StoreError> {
    let stable_id = generate_stable_id(url);
    conn.execute(
        "
        INSERT INTO chapters (stable_id, canonical_url, chapter_number, created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?4)
        ",
        params![stable_id, url, chapter_number, now.to_rfc3339()],
    )?;
    ensure_mapping_tx(conn, url, &stable_id, true, now)?;
    let normalized = normalize_url(url);
    if normalized != url {
        ensure_mapping_tx(conn, &normalized, &stable_id, false, now)?;
    }
    info!(stable_id = %stable_id, url, "created chapter");
    Ok(ChapterRecord {
        stable_id,
        canonical_url: url.to_string(),
        chapter_number,
        created_at: now,
        updated_at: now,
    })
}

/// Upsert one mapping row. A canonical upsert first demotes every other
/// mapping of the chapter and moves `chapters.canonical_url`; a
/// non-canonical upsert never demotes an existing canonical row for the same
/// chapter.
fn ensure_mapping_tx(
    conn: &Connection,
    url: &str,
    stable_id: &str,
    canonical: bool,
    now: DateTime<Utc>,
) -> Result<bool, StoreError> {
    let existed: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM url_mappings WHERE url = ?1",
            [url],
            |row| row.get(0),
        )
        .optional()?;

    if canonical {
        conn.execute(
            "UPDATE url_mappings SET is_canonical = 0 WHERE stable_id = ?1 AND url <> ?2",
            params![stable_id, url],
        )?;
        conn.execute(
            "UPDATE chapters SET canonical_url = ?2, updated_at = ?3 WHERE stable_id = ?1",
            params![stable_id, url, now.to_rfc3339()],
        )?;
    }

    conn.execute(
        "
        INSERT INTO url_mappings (url, stable_id, is_canonical)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(url) DO UPDATE SET
            stable_id = excluded.stable_id,
            is_canonical = CASE
                WHEN excluded.is_canonical = 1 THEN 1
                WHEN url_mappings.stable_id = excluded.stable_id THEN url_mappings.is_canonical
                ELSE 0
            END
        ",
        params![url, stable_id, canonical as i64],
    )?;

    Ok(existed.is_none())
}

/// Recreate the mapping rows of one chapter from its record.
fn backfill_chapter_tx(
    conn: &Connection,
    stable_id: &str,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let chapter = chapter_tx(conn, stable_id)?.ok_or_else(|| {
        StoreError::NotFound(format!("unknown stable id {stable_id}"))
    })?;
    let mut created = 0usize;
    if ensure_mapping_tx(conn, &chapter.canonical_url, stable_id, true, now)? {
        created += 1;
    }
    let normalized = normalize_url(&chapter.canonical_url);
    if normalized != chapter.canonical_url
        && ensure_mapping_tx(conn, &normalized, stable_id, false, now)?
    {
        created += 1;
    }
    Ok(created)
}

fn insert_translation_tx(
    conn: &Connection,
    stable_id: &str,
    result: &TranslationResult,
    settings: &TranslationSettings,
    now: DateTime<Utc>,
) -> Result<Translation, StoreError> {
    let next_version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM translations WHERE stable_id = ?1",
        [stable_id],
        |row| row.get(0),
    )?;

    let settings_json = serde_json::to_string(settings)
        .map_err(|err| StoreError::Serialization(err.to_string()))?;
    let usage_json = result
        .usage
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|err| StoreError::Serialization(err.to_string()))?;
    let footnotes_json = serde_json::to_string(&result.footnotes)
        .map_err(|err| StoreError::Serialization(err.to_string()))?;

    conn.execute(
        "
        INSERT INTO translations (
            stable_id, version, is_active, title, content,
            settings_json, usage_json, footnotes_json, created_at
        ) VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7, ?8)
        ",
        params![
            stable_id,
            next_version,
            result.translated_title,
            result.translation,
            settings_json,
            usage_json,
            footnotes_json,
            now.to_rfc3339(),
        ],
    )?;
    let id = conn.last_insert_rowid();
    conn.execute(
        "UPDATE translations SET is_active = 0 WHERE stable_id = ?1 AND id <> ?2",
        params![stable_id, id],
    )?;

    Ok(Translation {
        id,
        stable_id: stable_id.to_string(),
        version: next_version,
        is_active: true,
        title: result.translated_title.clone(),
        content: result.translation.clone(),
        settings: settings.clone(),
        usage: result.usage.clone(),
        footnotes: result.footnotes.clone(),
        created_at: now,
    })
}

fn translation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Translation> {
    let settings_json: String = row.get(6)?;
    let settings = serde_json::from_str(&settings_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let usage_json: Option<String> = row.get(7)?;
    let usage = usage_json
        .map(|json| {
            serde_json::from_str(&json).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    7,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })
        })
        .transpose()?;
    let footnotes_json: String = row.get(8)?;
    let footnotes = serde_json::from_str(&footnotes_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(err))
    })?;
    let created_at = parse_timestamp_sql(row.get::<_, String>(9)?, 9)?;

    Ok(Translation {
        id: row.get(0)?,
        stable_id: row.get(1)?,
        version: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        title: row.get(4)?,
        content: row.get(5)?,
        settings,
        usage,
        footnotes,
        created_at,
    })
}

fn parse_timestamp_sql(value: String, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use novl_core::migration_contracts::MigrationPhase;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn sample_settings() -> TranslationSettings {
        TranslationSettings {
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            temperature: 0.3,
            prompt_id: "default.v1".to_string(),
        }
    }

    fn sample_result(content: &str) -> TranslationResult {
        TranslationResult {
            translated_title: Some("Chapter One".to_string()),
            translation: content.to_string(),
            usage: None,
            footnotes: Vec::new(),
            suggested_illustrations: Vec::new(),
            proposal: None,
        }
    }

    #[test]
    fn migration_creates_session_tables() {
        let store = SessionStore::open_in_memory().expect("open store");
        let conn = store.lock().expect("lock");
        for table in ["chapters", "url_mappings", "translations", "settings"] {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?1",
                    [table],
                    |row| row.get(0),
                )
                .optional()
                .expect("table check");
            assert!(exists.is_some(), "missing table {table}");
        }
        drop(conn);
        assert_eq!(
            store.schema_version().expect("schema version"),
            SESSION_SCHEMA_VERSION
        );
    }

    #[test]
    fn store_translation_by_url_creates_chapter_and_canonical_mapping() {
        let store = SessionStore::open_in_memory().expect("open store");
        let translation = store
            .store_translation(
                &ChapterRef::url("https://x/ch1"),
                &sample_result("first pass"),
                &sample_settings(),
            )
            .expect("store translation");

        assert_eq!(translation.version, 1);
        assert!(translation.is_active);

        let chapter = store
            .chapter(&translation.stable_id)
            .expect("load chapter")
            .expect("chapter exists");
        assert_eq!(chapter.canonical_url, "https://x/ch1");

        let mappings = store.url_mappings(&translation.stable_id).expect("mappings");
        assert!(mappings.iter().any(|m| m.url == "https://x/ch1" && m.is_canonical));
    }

    #[test]
    fn end_to_end_url_scenario_matches_reader_expectations() {
        let store = SessionStore::open_in_memory().expect("open store");
        let url = "https://x/ch1";
        store
            .store_chapter(&NewChapter {
                url: url.to_string(),
                chapter_number: Some(1),
            })
            .expect("store chapter");

        store
            .store_translation(&ChapterRef::url(url), &sample_result("draft"), &sample_settings())
            .expect("first translation");
        store
            .store_translation(&ChapterRef::url(url), &sample_result("polish"), &sample_settings())
            .expect("second translation");

        let versions = store.versions_by_url(url).expect("versions by url");
        assert_eq!(
            versions.iter().map(|t| t.version).collect::<Vec<_>>(),
            vec![2, 1]
        );

        let active = store.active_by_url(url).expect("active").expect("present");
        assert_eq!(active.version, 2);

        store.set_active_by_url(url, 1).expect("set active 1");
        let active = store.active_by_url(url).expect("active").expect("present");
        assert_eq!(active.version, 1);

        let versions = store.versions_by_url(url).expect("versions");
        let v2 = versions.iter().find(|t| t.version == 2).expect("v2 row");
        assert!(!v2.is_active);
    }

    #[test]
    fn historical_urls_keep_resolving_after_canonical_change() {
        let store = SessionStore::open_in_memory().expect("open store");
        let chapter = store
            .store_chapter(&NewChapter {
                url: "https://old-host/ch9".to_string(),
                chapter_number: None,
            })
            .expect("store chapter");

        store
            .set_canonical_url(&chapter.stable_id, "https://new-host/ch9")
            .expect("move canonical url");

        let via_old = store
            .resolve(&ChapterRef::url("https://old-host/ch9"))
            .expect("old url resolves");
        let via_new = store
            .resolve(&ChapterRef::url("https://new-host/ch9"))
            .expect("new url resolves");
        assert_eq!(via_old, chapter.stable_id);
        assert_eq!(via_new, chapter.stable_id);

        let record = store
            .chapter(&chapter.stable_id)
            .expect("load")
            .expect("exists");
        assert_eq!(record.canonical_url, "https://new-host/ch9");

        let canonical: Vec<_> = store
            .url_mappings(&chapter.stable_id)
            .expect("mappings")
            .into_iter()
            .filter(|m| m.is_canonical)
            .collect();
        assert_eq!(canonical.len(), 1, "exactly one canonical mapping");
        assert_eq!(canonical[0].url, "https://new-host/ch9");
    }

    #[test]
    fn normalized_url_spelling_resolves() {
        let store = SessionStore::open_in_memory().expect("open store");
        let chapter = store
            .store_chapter(&NewChapter {
                url: "https://Example.com/Novel/ch1/".to_string(),
                chapter_number: None,
            })
            .expect("store chapter");

        let resolved = store
            .resolve(&ChapterRef::url("https://example.com/Novel/ch1?utm=feed"))
            .expect("variant spelling resolves");
        assert_eq!(resolved, chapter.stable_id);
    }

    #[test]
    fn unknown_stable_id_write_is_not_found() {
        let store = SessionStore::open_in_memory().expect("open store");
        let err = store
            .store_translation_by_stable_id(
                "ch_ffffffffffff",
                &sample_result("x"),
                &sample_settings(),
            )
            .expect_err("must fail");
        assert!(matches!(err, StoreError::NotFound(_)), "got {err:?}");
    }

    #[test]
    fn stable_id_lookup_self_heals_missing_mappings() {
        let store = SessionStore::open_in_memory().expect("open store");
        let chapter = store
            .store_chapter(&NewChapter {
                url: "https://x/ch3".to_string(),
                chapter_number: None,
            })
            .expect("store chapter");

        store
            .lock()
            .expect("lock")
            .execute("DELETE FROM url_mappings", [])
            .expect("drop mappings");

        let resolved = store
            .resolve(&ChapterRef::stable_id(&chapter.stable_id))
            .expect("stable id still resolves");
        assert_eq!(resolved, chapter.stable_id);

        let mappings = store.url_mappings(&chapter.stable_id).expect("mappings");
        assert!(
            mappings.iter().any(|m| m.is_canonical && m.url == "https://x/ch3"),
            "canonical mapping rebuilt: {mappings:?}"
        );
    }

    #[test]
    fn backfill_is_idempotent() {
        let store = SessionStore::open_in_memory().expect("open store");
        for url in ["https://x/ch1", "https://x/ch2", "https://x/ch3"] {
            store
                .store_chapter(&NewChapter {
                    url: url.to_string(),
                    chapter_number: None,
                })
                .expect("store chapter");
        }
        store
            .lock()
            .expect("lock")
            .execute("DELETE FROM url_mappings", [])
            .expect("drop mappings");

        let first = store.backfill_url_mappings().expect("first backfill");
        assert_eq!(first.chapters_scanned, 3);
        assert_eq!(first.mappings_created, 3);

        let second = store.backfill_url_mappings().expect("second backfill");
        assert_eq!(second.mappings_created, 0, "second run must be a no-op");
    }

    #[test]
    fn set_active_errors_distinguish_missing_chapter_from_missing_version() {
        let store = SessionStore::open_in_memory().expect("open store");
        let err = store
            .set_active("ch_ffffffffffff", 1)
            .expect_err("unknown chapter");
        assert!(matches!(err, StoreError::NotFound(_)), "got {err:?}");

        let translation = store
            .store_translation(
                &ChapterRef::url("https://x/ch1"),
                &sample_result("only"),
                &sample_settings(),
            )
            .expect("store");
        let err = store
            .set_active(&translation.stable_id, 7)
            .expect_err("unknown version");
        assert!(matches!(err, StoreError::Constraint(_)), "got {err:?}");
    }

    #[test]
    fn deleting_active_version_promotes_next_highest() {
        let store = SessionStore::open_in_memory().expect("open store");
        let url = "https://x/ch1";
        let v1 = store
            .store_translation(&ChapterRef::url(url), &sample_result("one"), &sample_settings())
            .expect("v1");
        let _v2 = store
            .store_translation(&ChapterRef::url(url), &sample_result("two"), &sample_settings())
            .expect("v2");
        let v3 = store
            .store_translation(&ChapterRef::url(url), &sample_result("three"), &sample_settings())
            .expect("v3");

        store.delete_version(v3.id).expect("delete active v3");
        let active = store.active(&v1.stable_id).expect("active").expect("present");
        assert_eq!(active.version, 2, "next-highest version promoted");

        store.delete_version(active.id).expect("delete v2");
        let active = store.active(&v1.stable_id).expect("active").expect("present");
        assert_eq!(active.version, 1);

        store.delete_version(v1.id).expect("delete last");
        assert!(store.active(&v1.stable_id).expect("active").is_none());
        assert!(store.versions(&v1.stable_id).expect("versions").is_empty());
    }

    #[test]
    fn deleting_inactive_version_leaves_active_untouched() {
        let store = SessionStore::open_in_memory().expect("open store");
        let url = "https://x/ch1";
        let v1 = store
            .store_translation(&ChapterRef::url(url), &sample_result("one"), &sample_settings())
            .expect("v1");
        let v2 = store
            .store_translation(&ChapterRef::url(url), &sample_result("two"), &sample_settings())
            .expect("v2");

        store.delete_version(v1.id).expect("delete inactive v1");
        let active = store.active(&v2.stable_id).expect("active").expect("present");
        assert_eq!(active.version, 2);
    }

    #[test]
    fn concurrent_stores_assign_distinct_contiguous_versions() {
        let store = Arc::new(SessionStore::open_in_memory().expect("open store"));
        let chapter = store
            .store_chapter(&NewChapter {
                url: "https://x/contended".to_string(),
                chapter_number: None,
            })
            .expect("store chapter");

        const WRITERS: usize = 8;
        let mut handles = Vec::new();
        for worker in 0..WRITERS {
            let store = Arc::clone(&store);
            let stable_id = chapter.stable_id.clone();
            handles.push(std::thread::spawn(move || {
                store
                    .store_translation_by_stable_id(
                        &stable_id,
                        &sample_result(&format!("attempt {worker}")),
                        &sample_settings(),
                    )
                    .expect("concurrent store")
            }));
        }
        for handle in handles {
            handle.join().expect("writer thread");
        }

        let mut versions: Vec<i64> = store
            .versions(&chapter.stable_id)
            .expect("versions")
            .iter()
            .map(|t| t.version)
            .collect();
        versions.sort();
        assert_eq!(versions, (1..=WRITERS as i64).collect::<Vec<_>>());

        let active_rows: Vec<_> = store
            .versions(&chapter.stable_id)
            .expect("versions")
            .into_iter()
            .filter(|t| t.is_active)
            .collect();
        assert_eq!(active_rows.len(), 1, "exactly one active row");
    }

    #[test]
    fn cleanup_repairs_active_invariant_and_reports_duplicates() {
        let store = SessionStore::open_in_memory().expect("open store");
        let url = "https://x/ch1";
        let v1 = store
            .store_translation(&ChapterRef::url(url), &sample_result("one"), &sample_settings())
            .expect("v1");
        store
            .store_translation(&ChapterRef::url(url), &sample_result("two"), &sample_settings())
            .expect("v2");

        // Simulate legacy corruption: both rows flagged active.
        store
            .lock()
            .expect("lock")
            .execute(
                "UPDATE translations SET is_active = 1 WHERE stable_id = ?1",
                [v1.stable_id.as_str()],
            )
            .expect("corrupt flags");

        let report = store.cleanup_duplicate_versions().expect("cleanup");
        assert_eq!(report.duplicates_removed, 0);
        assert_eq!(report.chapters_repaired, 1);

        let active = store.active(&v1.stable_id).expect("active").expect("present");
        assert_eq!(active.version, 2, "highest version wins the repair");

        let clean = store.cleanup_duplicate_versions().expect("cleanup again");
        assert_eq!(clean, CleanupReport::default());
    }

    #[test]
    fn migration_state_round_trips_through_settings_table() {
        let file = NamedTempFile::new().expect("temp db");
        let store = SessionStore::open(file.path()).expect("open store");

        assert_eq!(
            store.load_backend_mode().expect("default mode"),
            BackendMode::Legacy
        );

        let mut state = MigrationState::new("translations", Utc::now());
        state.phase = MigrationPhase::Reads;
        state.shadow_validated = true;
        store.save_migration_state(&state).expect("save state");
        store
            .save_backend_mode(BackendMode::Migrating)
            .expect("save mode");
        drop(store);

        let reopened = SessionStore::open(file.path()).expect("reopen store");
        let loaded = reopened
            .load_migration_state("translations")
            .expect("load state")
            .expect("state present");
        assert_eq!(loaded.phase, MigrationPhase::Reads);
        assert!(loaded.shadow_validated);
        assert_eq!(
            reopened.load_backend_mode().expect("mode"),
            BackendMode::Migrating
        );
        assert_eq!(reopened.list_migration_states().expect("list").len(), 1);
    }
}
