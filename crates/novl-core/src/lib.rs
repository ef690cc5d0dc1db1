pub mod migration_contracts;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use uuid::Uuid;

pub const STABLE_ID_PREFIX: &str = "ch_";
pub const STABLE_ID_HEX_LEN: usize = 12;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChapterRecord {
    pub stable_id: String,
    pub canonical_url: String,
    pub chapter_number: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewChapter {
    pub url: String,
    #[serde(default)]
    pub chapter_number: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UrlMapping {
    pub url: String,
    pub stable_id: String,
    pub is_canonical: bool,
}

/// Snapshot of the provider settings a translation was produced with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranslationSettings {
    pub provider: String,
    pub model: String,
    pub temperature: f64,
    pub prompt_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageMetrics {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub estimated_cost: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Footnote {
    pub marker: String,
    pub text: String,
}

/// Request shape consumed by the external AI translation layer. Persisted
/// here only as part of a settings snapshot, never constructed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranslationRequest {
    pub title: String,
    pub content: String,
    pub settings: TranslationSettings,
}

/// Result shape produced by the external AI translation layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranslationResult {
    #[serde(default)]
    pub translated_title: Option<String>,
    pub translation: String,
    #[serde(default)]
    pub usage: Option<UsageMetrics>,
    #[serde(default)]
    pub footnotes: Vec<Footnote>,
    #[serde(default)]
    pub suggested_illustrations: Vec<String>,
    #[serde(default)]
    pub proposal: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Translation {
    pub id: i64,
    pub stable_id: String,
    pub version: i64,
    pub is_active: bool,
    pub title: Option<String>,
    pub content: String,
    pub settings: TranslationSettings,
    pub usage: Option<UsageMetrics>,
    pub footnotes: Vec<Footnote>,
    pub created_at: DateTime<Utc>,
}

/// A chapter address as callers know it: either some historical URL or the
/// immutable stable identifier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChapterRef {
    Url(String),
    StableId(String),
}

impl ChapterRef {
    pub fn url(url: impl Into<String>) -> Self {
        ChapterRef::Url(url.into())
    }

    pub fn stable_id(id: impl Into<String>) -> Self {
        ChapterRef::StableId(id.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            ChapterRef::Url(url) => url,
            ChapterRef::StableId(id) => id,
        }
    }
}

/// Derive a fresh stable chapter identifier from the first URL a chapter was
/// sighted at. The uuid component keeps two chapters sharing a seed URL from
/// colliding; the id never changes afterwards even if the URL does.
pub fn generate_stable_id(seed_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(seed_url.as_bytes());
    hasher.update(Uuid::new_v4().as_bytes());
    let digest = hasher.finalize();
    let mut id = String::with_capacity(STABLE_ID_PREFIX.len() + STABLE_ID_HEX_LEN);
    id.push_str(STABLE_ID_PREFIX);
    for byte in &digest[..STABLE_ID_HEX_LEN / 2] {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

fn stable_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^ch_[0-9a-f]{12}$").expect("valid stable id pattern"))
}

pub fn is_stable_id_shape(candidate: &str) -> bool {
    stable_id_pattern().is_match(candidate)
}

/// Fixed URL normalization applied before mapping lookups: drop fragment and
/// query, drop trailing slashes, case-fold scheme and host (path case is
/// preserved).
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
    let without_query = without_fragment.split('?').next().unwrap_or(without_fragment);
    let stripped = without_query.trim_end_matches('/');

    match stripped.find("://") {
        Some(scheme_idx) => {
            let (scheme, rest) = stripped.split_at(scheme_idx + 3);
            match rest.find('/') {
                Some(path_idx) => {
                    let (host, path) = rest.split_at(path_idx);
                    format!(
                        "{}{}{}",
                        scheme.to_ascii_lowercase(),
                        host.to_ascii_lowercase(),
                        path
                    )
                }
                None => format!(
                    "{}{}",
                    scheme.to_ascii_lowercase(),
                    rest.to_ascii_lowercase()
                ),
            }
        }
        None => stripped.to_ascii_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_ids_have_the_documented_shape_and_do_not_collide() {
        let a = generate_stable_id("https://example.com/novel/ch1");
        let b = generate_stable_id("https://example.com/novel/ch1");

        assert!(is_stable_id_shape(&a), "generated id {a} has wrong shape");
        assert!(is_stable_id_shape(&b), "generated id {b} has wrong shape");
        assert_ne!(a, b, "same seed URL must still yield distinct ids");
    }

    #[test]
    fn stable_id_shape_rejects_near_misses() {
        assert!(is_stable_id_shape("ch_0123456789ab"));
        assert!(!is_stable_id_shape("ch_0123456789AB"));
        assert!(!is_stable_id_shape("ch_0123456789"));
        assert!(!is_stable_id_shape("chapter_0123456789ab"));
        assert!(!is_stable_id_shape("https://example.com/ch1"));
    }

    #[test]
    fn normalize_url_strips_query_fragment_and_trailing_slash() {
        assert_eq!(
            normalize_url("HTTPS://Example.COM/Novel/Ch1/?ref=feed#top"),
            "https://example.com/Novel/Ch1"
        );
        assert_eq!(
            normalize_url("https://example.com/novel/ch1"),
            normalize_url("https://example.com/novel/ch1/")
        );
    }

    #[test]
    fn normalize_url_preserves_path_case() {
        assert_eq!(
            normalize_url("https://EXAMPLE.com/Series/CHAPTER-2"),
            "https://example.com/Series/CHAPTER-2"
        );
    }

    #[test]
    fn chapter_ref_exposes_raw_address() {
        assert_eq!(ChapterRef::url("https://x/ch1").as_str(), "https://x/ch1");
        assert_eq!(
            ChapterRef::stable_id("ch_0123456789ab").as_str(),
            "ch_0123456789ab"
        );
    }
}
