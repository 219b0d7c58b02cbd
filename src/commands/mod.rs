use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::info;

use crate::cli::FetchArgs;
use crate::input::arxiv_id_from;
use crate::config::{JudgeSettings, RetryPolicy};
use crate::judge::{GuardedJudge, JudgeService, OpenAiCompatJudge};
use crate::retrieval::HttpRetriever;
use crate::urls::{CacheStore, UrlCache};

pub mod citations;
pub mod manifest;
pub mod metrics;
pub mod statements;
pub mod status;

pub const STATEMENTS_FILE: &str = "statements.jsonl";
pub const STATEMENT_SUMMARY_FILE: &str = "statement_summary.json";
pub const CITATIONS_FILE: &str = "citations.json";
pub const REPORT_METRICS_FILE: &str = "metrics.json";
pub const CORPUS_METRICS_FILE: &str = "metrics.jsonl";
pub const CORPUS_SUMMARY_FILE: &str = "summary.json";
pub const RUN_MANIFEST_FILE: &str = "run_manifest.json";

/// Run-scoped URL cache over the HTTP retriever, optionally backed by SQLite.
pub fn build_url_cache(fetch: &FetchArgs, deadline: Option<Instant>) -> Result<Arc<UrlCache>> {
    let retriever = HttpRetriever::new(
        std::time::Duration::from_secs(fetch.fetch_timeout_secs),
        fetch.retry_policy(),
        fetch.max_in_flight,
    )?;

    let mut cache = UrlCache::new(Arc::new(retriever)).with_deadline(deadline);
    if let Some(path) = &fetch.cache_db {
        cache = cache.with_store(CacheStore::open(path)?);
        info!(path = %path.display(), "using persistent url cache");
    }

    Ok(Arc::new(cache))
}

/// OpenAI-compatible judge behind the shared in-flight cap, retries and the
/// run deadline.
pub fn guarded_judge(
    settings: &JudgeSettings,
    limiter: &Arc<Semaphore>,
    retry: RetryPolicy,
    deadline: Option<Instant>,
) -> Result<Arc<dyn JudgeService>> {
    let judge = OpenAiCompatJudge::new(settings.clone())?;
    Ok(Arc::new(
        GuardedJudge::new(Arc::new(judge), limiter.clone(), retry).with_deadline(deadline),
    ))
}

/// Report id recoverable from the file name alone, for failure records.
pub fn report_id_hint(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .and_then(arxiv_id_from)
}

pub fn report_output_dir(output_dir: &Path, report_id: &str) -> std::path::PathBuf {
    output_dir.join(report_id)
}
