use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::judge::{JudgeService, parse_json_object, reason_text, verdict_flag};
use crate::model::ReferenceEntry;
use crate::retrieval::FetchOutcome;
use crate::urls::UrlCache;
use crate::util::truncate_chars;

const MAX_PAGE_CHARS: usize = 8_000;

/// Hosts whose pages are papers or paper landing pages.
const SCHOLARLY_HOSTS: &[&str] = &[
    "arxiv.org",
    "doi.org",
    "aclanthology.org",
    "openreview.net",
    "proceedings.neurips.cc",
    "papers.nips.cc",
    "proceedings.mlr.press",
    "openaccess.thecvf.com",
    "dl.acm.org",
    "ieeexplore.ieee.org",
    "link.springer.com",
    "sciencedirect.com",
    "semanticscholar.org",
    "aaai.org",
    "ijcai.org",
    "jmlr.org",
    "nature.com",
    "science.org",
    "pubmed.ncbi.nlm.nih.gov",
    "biorxiv.org",
    "medrxiv.org",
];

/// Outcome of checking one URL-only reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaperCheck {
    pub marker: String,
    pub url: String,
    pub is_paper: bool,
    pub title: Option<String>,
    pub reason: String,
}

/// Decides whether a fetched page is an academic paper and names it. Without
/// a judge, or when the judge call fails, the host decides and the page title
/// is used.
pub struct PaperClassifier {
    judge: Option<Arc<dyn JudgeService>>,
}

impl PaperClassifier {
    pub fn new(judge: Arc<dyn JudgeService>) -> Self {
        Self { judge: Some(judge) }
    }

    pub fn by_host() -> Self {
        Self { judge: None }
    }

    pub async fn classify(&self, url: &str, page: &FetchOutcome) -> (bool, Option<String>, String) {
        let Some(judge) = &self.judge else {
            return host_verdict(url, page);
        };

        let reply = match judge.complete(&paper_prompt(url, &page.text)).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(url, error = %err, "paper check failed; deciding by host");
                return host_verdict(url, page);
            }
        };

        let Ok(map) = parse_json_object(&reply) else {
            return (false, None, "paper check reply unreadable".to_string());
        };
        let is_paper = verdict_flag(&map, &["is_academic_paper"]).unwrap_or(false);
        let title = map
            .get("title")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .map(ToOwned::to_owned)
            .or_else(|| page.title.clone());

        (is_paper, title.filter(|_| is_paper), reason_text(&map))
    }
}

fn host_verdict(url: &str, page: &FetchOutcome) -> (bool, Option<String>, String) {
    if is_scholarly_host(url) {
        (true, page.title.clone(), "scholarly host".to_string())
    } else {
        (false, None, "not a scholarly host".to_string())
    }
}

pub fn is_scholarly_host(url: &str) -> bool {
    let Some(host) = url::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
    else {
        return false;
    };
    SCHOLARLY_HOSTS
        .iter()
        .any(|known| host == *known || host.ends_with(&format!(".{known}")))
}

fn paper_prompt(url: &str, page_text: &str) -> String {
    let excerpt = truncate_chars(page_text, MAX_PAGE_CHARS);
    format!(
        "Decide whether the web page below is an academic paper (or the landing page of one). \
If it is, extract its title.\n\n\
[URL]: {url}\n\n\
[Page content]:\n{excerpt}\n\n\
Respond with JSON containing:\n  \"is_academic_paper\": true or false\n  \
\"title\": the paper title, or an empty string\n  \"reason\": one short sentence\n\
Return ONLY the JSON."
    )
}

/// Fetches every URL-only reference and keeps a title only for pages the
/// classifier accepts as papers. Titled references pass through untouched.
pub async fn check_url_references(
    references: &[ReferenceEntry],
    cache: &UrlCache,
    classifier: &PaperClassifier,
) -> (Vec<ReferenceEntry>, Vec<PaperCheck>) {
    let checked = join_all(references.iter().map(|entry| async move {
        let mut entry = entry.clone();
        let url = match (&entry.title, &entry.url) {
            (None, Some(url)) => url.clone(),
            _ => return (entry, None),
        };

        let page = cache.get_or_fetch(&url).await;
        let (is_paper, title, reason) = if page.is_fetched() {
            classifier.classify(&url, &page).await
        } else {
            let reason = page.error.clone().unwrap_or_else(|| "fetch failed".to_string());
            (false, None, reason)
        };
        debug!(url = %url, is_paper, "checked url reference");

        entry.title = title.clone();
        let check = PaperCheck {
            marker: entry.marker.clone(),
            url,
            is_paper,
            title,
            reason,
        };
        (entry, Some(check))
    }))
    .await;

    let mut entries = Vec::with_capacity(checked.len());
    let mut checks = Vec::new();
    for (entry, check) in checked {
        entries.push(entry);
        checks.extend(check);
    }
    (entries, checks)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::judge::JudgeError;
    use crate::judge::stubs::ScriptedJudge;
    use crate::retrieval::{ContentKind, ContentRetriever};

    struct PageRetriever;

    #[async_trait]
    impl ContentRetriever for PageRetriever {
        async fn fetch(&self, url: &str) -> FetchOutcome {
            if url.contains("gone") {
                return FetchOutcome::failed("http status 404");
            }
            FetchOutcome::fetched(
                format!("body of {url}"),
                Some("Page Title | Site".to_string()),
                Some(ContentKind::Html),
            )
        }
    }

    fn url_entry(marker: &str, url: &str) -> ReferenceEntry {
        ReferenceEntry {
            marker: marker.to_string(),
            title: None,
            url: Some(url.to_string()),
        }
    }

    #[test]
    fn scholarly_hosts_include_subdomains() {
        assert!(is_scholarly_host("https://arxiv.org/abs/1706.03762"));
        assert!(is_scholarly_host("https://www.nature.com/articles/x"));
        assert!(!is_scholarly_host("https://github.com/org/repo"));
        assert!(!is_scholarly_host("not a url"));
    }

    #[tokio::test]
    async fn judge_title_is_used_and_non_papers_lose_their_title() {
        let cache = UrlCache::new(Arc::new(PageRetriever));
        let judge = ScriptedJudge::new(
            "paper-check",
            vec![
                Ok(r#"{"is_academic_paper": true, "title": "Attention Is All You Need", "reason": "abstract and authors"}"#.to_string()),
                Ok(r#"```json
{"is_academic_paper": false, "title": "", "reason": "a blog post"}
```"#
                    .to_string()),
            ],
        );
        let classifier = PaperClassifier::new(Arc::new(judge));
        let references = vec![
            url_entry("1", "https://arxiv.org/abs/1706.03762"),
            ReferenceEntry {
                marker: "2".to_string(),
                title: Some("Known Title".to_string()),
                url: Some("https://example.org/known".to_string()),
            },
        ];

        let (entries, checks) = check_url_references(&references, &cache, &classifier).await;
        assert_eq!(entries[0].title.as_deref(), Some("Attention Is All You Need"));
        assert_eq!(entries[1].title.as_deref(), Some("Known Title"));
        assert_eq!(checks.len(), 1);
        assert!(checks[0].is_paper);

        let blog = vec![url_entry("3", "https://blog.example.com/post")];
        let (entries, checks) = check_url_references(&blog, &cache, &classifier).await;
        assert_eq!(entries[0].title, None);
        assert!(!checks[0].is_paper);
        assert_eq!(checks[0].reason, "a blog post");
    }

    #[tokio::test]
    async fn failed_judge_and_failed_fetch_fall_back() {
        let cache = UrlCache::new(Arc::new(PageRetriever));
        let classifier = PaperClassifier::new(Arc::new(ScriptedJudge::failing(
            "paper-check",
            JudgeError::Timeout,
        )));
        let references = vec![
            url_entry("1", "https://openreview.net/forum?id=abc"),
            url_entry("2", "https://github.com/org/repo"),
            url_entry("3", "https://arxiv.org/gone"),
        ];

        let (entries, checks) = check_url_references(&references, &cache, &classifier).await;
        assert_eq!(entries[0].title.as_deref(), Some("Page Title | Site"));
        assert_eq!(entries[1].title, None);
        assert_eq!(entries[2].title, None);
        assert!(!checks[2].is_paper);
        assert!(checks[2].reason.contains("404"));
    }

    #[tokio::test]
    async fn unreadable_reply_counts_as_not_a_paper() {
        let cache = UrlCache::new(Arc::new(PageRetriever));
        let classifier =
            PaperClassifier::new(Arc::new(ScriptedJudge::always("paper-check", "no idea")));
        let (entries, checks) = check_url_references(
            &[url_entry("1", "https://arxiv.org/abs/2005.14165")],
            &cache,
            &classifier,
        )
        .await;
        assert_eq!(entries[0].title, None);
        assert!(!checks[0].is_paper);
    }
}
