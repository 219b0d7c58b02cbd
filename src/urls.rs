use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::OnceCell;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};
use url::Url;

use crate::retrieval::{ContentKind, ContentRetriever, FetchOutcome};
use crate::util::{now_utc_string, sha256_hex};

const TRACKING_PARAMS: &[&str] = &[
    "fbclid", "gclid", "dclid", "msclkid", "yclid", "mc_cid", "mc_eid", "igshid", "ref_src", "_ga",
    "_gl", "spm",
];

const HOST_ALIASES: &[(&str, &str)] = &[
    ("dx.doi.org", "doi.org"),
    ("www.doi.org", "doi.org"),
    ("export.arxiv.org", "arxiv.org"),
    ("www.arxiv.org", "arxiv.org"),
];

const URL_ID_LEN: usize = 16;

fn is_tracking_param(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("utm_") || TRACKING_PARAMS.contains(&lower.as_str())
}

/// Canonical form used as the cache key: lower-cased scheme and host, no
/// fragment, no tracking parameters, no trailing slash, known host aliases
/// folded. Input that does not parse as an absolute URL is returned trimmed.
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let Ok(parsed) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };

    let Some(host) = parsed.host_str().map(str::to_ascii_lowercase) else {
        return parsed.to_string();
    };
    let host = HOST_ALIASES
        .iter()
        .find(|(alias, _)| *alias == host)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(host);

    let mut canonical = format!("{}://{}", parsed.scheme().to_ascii_lowercase(), host);
    if let Some(port) = parsed.port() {
        canonical.push_str(&format!(":{port}"));
    }
    canonical.push_str(parsed.path().trim_end_matches('/'));

    let kept = parsed
        .query_pairs()
        .filter(|(name, _)| !is_tracking_param(name))
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect::<Vec<(String, String)>>();
    if !kept.is_empty() {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(kept.iter())
            .finish();
        canonical.push('?');
        canonical.push_str(&query);
    }

    canonical
}

pub fn url_id(raw: &str) -> String {
    let digest = sha256_hex(&normalize(raw));
    digest[..URL_ID_LEN].to_string()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub fetches: usize,
    pub store_hits: usize,
}

/// Run-scoped content cache keyed by normalized URL. Each key owns a
/// once-cell, so concurrent lookups of one URL share a single fetch and a
/// failed fetch is remembered for the rest of the run.
pub struct UrlCache {
    retriever: Arc<dyn ContentRetriever>,
    entries: Mutex<HashMap<String, Arc<OnceCell<FetchOutcome>>>>,
    store: Option<CacheStore>,
    deadline: Option<Instant>,
    fetches: AtomicUsize,
    store_hits: AtomicUsize,
}

impl UrlCache {
    pub fn new(retriever: Arc<dyn ContentRetriever>) -> Self {
        Self {
            retriever,
            entries: Mutex::new(HashMap::new()),
            store: None,
            deadline: None,
            fetches: AtomicUsize::new(0),
            store_hits: AtomicUsize::new(0),
        }
    }

    pub fn with_store(mut self, store: CacheStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub async fn get_or_fetch(&self, url: &str) -> FetchOutcome {
        let key = normalize(url);
        let cell = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.entry(key.clone()).or_default().clone()
        };

        cell.get_or_init(|| self.load(&key)).await.clone()
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        CacheStats {
            entries,
            fetches: self.fetches.load(Ordering::Relaxed),
            store_hits: self.store_hits.load(Ordering::Relaxed),
        }
    }

    async fn load(&self, key: &str) -> FetchOutcome {
        if let Some(store) = &self.store {
            match store.get(key) {
                Ok(Some(outcome)) => {
                    self.store_hits.fetch_add(1, Ordering::Relaxed);
                    debug!(url = %key, "url cache store hit");
                    return outcome;
                }
                Ok(None) => {}
                Err(err) => warn!(url = %key, error = %err, "url cache store lookup failed"),
            }
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let outcome = match self.deadline {
            Some(deadline) => timeout_at(deadline, self.retriever.fetch(key))
                .await
                .unwrap_or_else(|_| FetchOutcome::failed("run deadline exceeded")),
            None => self.retriever.fetch(key).await,
        };

        if outcome.is_fetched() {
            if let Some(store) = &self.store {
                if let Err(err) = store.put(key, &outcome) {
                    warn!(url = %key, error = %err, "failed to persist fetched content");
                }
            }
        } else {
            debug!(
                url = %key,
                error = %outcome.error.as_deref().unwrap_or_default(),
                "fetch failed; tombstoned for this run"
            );
        }

        outcome
    }
}

/// Optional SQLite persistence for successful fetches. Failures are never
/// written, so a later run retries them.
pub struct CacheStore {
    connection: Mutex<Connection>,
}

impl CacheStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            crate::util::ensure_directory(parent)?;
        }
        let connection = Connection::open(path)
            .with_context(|| format!("failed to open url cache db: {}", path.display()))?;
        Self::from_connection(connection)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let connection = Connection::open_in_memory().context("failed to open in-memory db")?;
        Self::from_connection(connection)
    }

    fn from_connection(connection: Connection) -> Result<Self> {
        connection
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS url_cache (
                  normalized_url TEXT PRIMARY KEY,
                  url_id TEXT NOT NULL,
                  content_kind TEXT,
                  title TEXT,
                  text TEXT NOT NULL,
                  fetched_at TEXT NOT NULL
                );
                ",
            )
            .context("failed to initialize url cache schema")?;

        Ok(Self {
            connection: Mutex::new(connection),
        })
    }

    pub fn get(&self, normalized_url: &str) -> Result<Option<FetchOutcome>> {
        let connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        let row = connection
            .query_row(
                "SELECT content_kind, title, text FROM url_cache WHERE normalized_url = ?1",
                params![normalized_url],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to query url cache for {normalized_url}"))?;

        Ok(row.map(|(content_kind, title, text)| {
            FetchOutcome::fetched(
                text,
                title,
                content_kind.as_deref().and_then(ContentKind::parse),
            )
        }))
    }

    pub fn put(&self, normalized_url: &str, outcome: &FetchOutcome) -> Result<()> {
        let connection = self.connection.lock().unwrap_or_else(PoisonError::into_inner);
        connection
            .execute(
                "
                INSERT OR REPLACE INTO url_cache
                  (normalized_url, url_id, content_kind, title, text, fetched_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
                params![
                    normalized_url,
                    url_id(normalized_url),
                    outcome.content_kind.map(ContentKind::as_str),
                    outcome.title,
                    outcome.text,
                    now_utc_string(),
                ],
            )
            .with_context(|| format!("failed to store url cache row for {normalized_url}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::FetchStatus;
    use async_trait::async_trait;
    use std::time::Duration;

    struct CountingRetriever {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl ContentRetriever for CountingRetriever {
        async fn fetch(&self, url: &str) -> FetchOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail {
                FetchOutcome::failed("connection refused")
            } else {
                FetchOutcome::fetched(format!("body of {url}"), None, Some(ContentKind::Html))
            }
        }
    }

    fn counting(fail: bool) -> Arc<CountingRetriever> {
        Arc::new(CountingRetriever {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    #[test]
    fn normalize_strips_tracking_fragment_and_trailing_slash() {
        assert_eq!(
            normalize("https://EXAMPLE.com/path/?utm_source=x#frag"),
            normalize("https://example.com/path")
        );
        assert_eq!(
            normalize("https://EXAMPLE.com/path/?utm_source=x#frag"),
            "https://example.com/path"
        );
    }

    #[test]
    fn normalize_keeps_meaningful_query_parameters() {
        assert_eq!(
            normalize("https://example.com/search?q=rust&utm_medium=email&fbclid=abc"),
            "https://example.com/search?q=rust"
        );
    }

    #[test]
    fn normalize_folds_known_host_aliases_and_default_ports() {
        assert_eq!(
            normalize("http://dx.doi.org/10.1000/xyz123"),
            "http://doi.org/10.1000/xyz123"
        );
        assert_eq!(
            normalize("https://export.arxiv.org:443/abs/2101.01507/"),
            "https://arxiv.org/abs/2101.01507"
        );
        assert_eq!(
            normalize("https://example.com:8443/a"),
            "https://example.com:8443/a"
        );
    }

    #[test]
    fn normalize_returns_unparseable_input_trimmed() {
        assert_eq!(normalize("  not a url "), "not a url");
    }

    #[test]
    fn url_id_is_shared_by_equivalent_urls() {
        let first = url_id("https://Example.com/a/#x");
        let second = url_id("https://example.com/a");
        assert_eq!(first, second);
        assert_eq!(first.len(), URL_ID_LEN);
    }

    #[tokio::test]
    async fn concurrent_lookups_share_one_fetch() {
        let retriever = counting(false);
        let cache = UrlCache::new(retriever.clone());

        let (first, second, third) = tokio::join!(
            cache.get_or_fetch("https://example.com/a"),
            cache.get_or_fetch("https://EXAMPLE.com/a/"),
            cache.get_or_fetch("https://example.com/a#section"),
        );

        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
        assert_eq!(first.text, second.text);
        assert_eq!(second.text, third.text);
        assert_eq!(cache.stats().entries, 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_retried_within_run() {
        let retriever = counting(true);
        let cache = UrlCache::new(retriever.clone());

        let first = cache.get_or_fetch("https://example.com/down").await;
        let second = cache.get_or_fetch("https://example.com/down").await;

        assert_eq!(first.status, FetchStatus::Failed);
        assert_eq!(second.status, FetchStatus::Failed);
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_deadline_degrades_to_failed_fetch() {
        let retriever = counting(false);
        let cache = UrlCache::new(retriever).with_deadline(Some(Instant::now()));

        let outcome = cache.get_or_fetch("https://example.com/slow").await;
        assert_eq!(outcome.status, FetchStatus::Failed);
        assert!(outcome.text.is_empty());
    }

    #[tokio::test]
    async fn store_serves_persisted_content_without_refetching() {
        let store = CacheStore::open_in_memory().expect("in-memory store should open");
        store
            .put(
                "https://example.com/a",
                &FetchOutcome::fetched("persisted".into(), Some("Title".into()), None),
            )
            .expect("put should succeed");

        let retriever = counting(false);
        let cache = UrlCache::new(retriever.clone()).with_store(store);
        let outcome = cache.get_or_fetch("https://example.com/a/").await;

        assert_eq!(outcome.text, "persisted");
        assert_eq!(outcome.title.as_deref(), Some("Title"));
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.stats().store_hits, 1);
    }

    #[test]
    fn store_round_trips_content_kind() {
        let store = CacheStore::open_in_memory().expect("in-memory store should open");
        store
            .put(
                "https://example.com/paper.pdf",
                &FetchOutcome::fetched("pdf text".into(), None, Some(ContentKind::Pdf)),
            )
            .expect("put should succeed");

        let loaded = store
            .get("https://example.com/paper.pdf")
            .expect("get should succeed")
            .expect("row should exist");
        assert_eq!(loaded.content_kind, Some(ContentKind::Pdf));
        assert!(store.get("https://example.com/missing").expect("get").is_none());
    }
}
