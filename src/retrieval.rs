use std::fs;
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::RetryPolicy;

const SKIPPED_ELEMENTS: &[&str] = &[
    "script", "style", "noscript", "iframe", "svg", "head", "nav", "footer", "form", "button",
];

static PDF_SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    Html,
    Pdf,
    PlainText,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Pdf => "pdf",
            Self::PlainText => "plain_text",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "html" => Some(Self::Html),
            "pdf" => Some(Self::Pdf),
            "plain_text" => Some(Self::PlainText),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchStatus {
    Fetched,
    Failed,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub status: FetchStatus,
    pub text: String,
    pub title: Option<String>,
    pub content_kind: Option<ContentKind>,
    pub error: Option<String>,
}

impl FetchOutcome {
    pub fn fetched(text: String, title: Option<String>, content_kind: Option<ContentKind>) -> Self {
        Self {
            status: FetchStatus::Fetched,
            text,
            title,
            content_kind,
            error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: FetchStatus::Failed,
            text: String::new(),
            title: None,
            content_kind: None,
            error: Some(reason.into()),
        }
    }

    pub fn is_fetched(&self) -> bool {
        self.status == FetchStatus::Fetched
    }
}

/// Turns a URL into plain text. Implementations never fail: every problem is
/// reported as a `Failed` outcome with empty text.
#[async_trait]
pub trait ContentRetriever: Send + Sync {
    async fn fetch(&self, url: &str) -> FetchOutcome;
}

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http status {0}")]
    Status(u16),
    #[error("unsupported content type: {0}")]
    Unsupported(String),
    #[error("pdf extraction failed: {0}")]
    Pdf(String),
    #[error("document has no extractable text")]
    Empty,
}

impl FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Transport(_) => true,
            Self::Status(code) => *code == 429 || (500..=599).contains(code),
            Self::Unsupported(_) | Self::Pdf(_) | Self::Empty => false,
        }
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(err.to_string())
    }
}

pub struct HttpRetriever {
    client: reqwest::Client,
    retry: RetryPolicy,
    limiter: Arc<Semaphore>,
}

impl HttpRetriever {
    pub fn new(timeout: Duration, retry: RetryPolicy, max_in_flight: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("reportbench/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            client,
            retry,
            limiter: Arc::new(Semaphore::new(max_in_flight.max(1))),
        })
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchOutcome, FetchError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| FetchError::Transport("fetch limiter closed".to_string()))?;

        let response = self.client.get(url).send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        decode_body(&content_type, body.to_vec()).await
    }
}

#[async_trait]
impl ContentRetriever for HttpRetriever {
    async fn fetch(&self, url: &str) -> FetchOutcome {
        let mut attempt = 0;
        loop {
            match self.fetch_once(url).await {
                Ok(outcome) => return outcome,
                Err(err) if err.is_retryable() && attempt + 1 < self.retry.max_attempts => {
                    let wait = self.retry.delay_for(attempt);
                    debug!(
                        url = %url,
                        attempt = attempt + 1,
                        backoff_ms = wait.as_millis() as u64,
                        error = %err,
                        "retrying fetch after transient error"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => {
                    warn!(url = %url, attempts = attempt + 1, error = %err, "fetch failed");
                    return FetchOutcome::failed(err.to_string());
                }
            }
        }
    }
}

pub fn classify_content(content_type: &str, body: &[u8]) -> Option<ContentKind> {
    if content_type.contains("application/pdf") || body.starts_with(b"%PDF") {
        return Some(ContentKind::Pdf);
    }
    if content_type.contains("html") {
        return Some(ContentKind::Html);
    }
    if content_type.starts_with("text/")
        || content_type.contains("json")
        || content_type.contains("markdown")
    {
        return Some(ContentKind::PlainText);
    }
    if content_type.is_empty() {
        let head = String::from_utf8_lossy(&body[..body.len().min(512)]).to_ascii_lowercase();
        if head.trim_start().starts_with('<') && head.contains("<html") {
            return Some(ContentKind::Html);
        }
        if std::str::from_utf8(body).is_ok() {
            return Some(ContentKind::PlainText);
        }
    }
    None
}

async fn decode_body(content_type: &str, body: Vec<u8>) -> Result<FetchOutcome, FetchError> {
    let kind = classify_content(content_type, &body)
        .ok_or_else(|| FetchError::Unsupported(content_type.to_string()))?;

    let (text, title) = match kind {
        ContentKind::Html => {
            let page = html_to_text(&String::from_utf8_lossy(&body));
            (page.text, page.title)
        }
        ContentKind::Pdf => {
            let text = tokio::task::spawn_blocking(move || pdf_to_text(&body))
                .await
                .map_err(|err| FetchError::Pdf(err.to_string()))?
                .map_err(|err| FetchError::Pdf(format!("{err:#}")))?;
            let title = pdf_title_line(&text);
            (text, title)
        }
        ContentKind::PlainText => {
            let text = String::from_utf8_lossy(&body).into_owned();
            let title = markdown_title(&text);
            (text, title)
        }
    };

    if text.trim().is_empty() {
        return Err(FetchError::Empty);
    }

    Ok(FetchOutcome::fetched(text, title, Some(kind)))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlPage {
    pub title: Option<String>,
    pub text: String,
}

pub fn html_to_text(html: &str) -> HtmlPage {
    let document = Html::parse_document(html);

    let title = Selector::parse("title")
        .ok()
        .and_then(|selector| {
            document
                .select(&selector)
                .next()
                .map(|element| collapse_whitespace(&element.text().collect::<String>()))
        })
        .filter(|value| !value.is_empty());

    let mut parts = Vec::new();
    let root = Selector::parse("body")
        .ok()
        .and_then(|selector| document.select(&selector).next())
        .unwrap_or_else(|| document.root_element());
    collect_text(root, &mut parts);

    HtmlPage {
        title,
        text: parts.join("\n"),
    }
}

fn collect_text(element: ElementRef, parts: &mut Vec<String>) {
    if SKIPPED_ELEMENTS.contains(&element.value().name()) {
        return;
    }

    for child in element.children() {
        match child.value() {
            Node::Text(text) => {
                let collapsed = collapse_whitespace(text);
                if !collapsed.is_empty() {
                    parts.push(collapsed);
                }
            }
            Node::Element(_) => {
                if let Some(child_element) = ElementRef::wrap(child) {
                    collect_text(child_element, parts);
                }
            }
            _ => {}
        }
    }
}

fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<&str>>().join(" ")
}

const PDF_BANNER_PREFIXES: &[&str] = &[
    "arxiv:",
    "preprint",
    "published as",
    "proceedings of",
    "under review",
    "accepted at",
    "accepted to",
];

/// First line of extracted PDF text that reads like a title. Skips arXiv
/// stamps, venue banners and page furniture.
fn pdf_title_line(text: &str) -> Option<String> {
    text.lines()
        .take(40)
        .map(collapse_whitespace)
        .find(|line| {
            let lowered = line.to_lowercase();
            line.chars().filter(|ch| ch.is_alphabetic()).count() >= 8
                && !PDF_BANNER_PREFIXES
                    .iter()
                    .any(|prefix| lowered.starts_with(prefix))
        })
}

fn markdown_title(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(|heading| heading.trim().to_string())
        .filter(|heading| !heading.is_empty())
}

fn pdf_to_text(body: &[u8]) -> Result<String> {
    let stamp = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let sequence = PDF_SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    let scratch_path = std::env::temp_dir().join(format!(
        "reportbench_pdf_{}_{}_{}.pdf",
        std::process::id(),
        sequence,
        stamp
    ));

    fs::write(&scratch_path, body)
        .with_context(|| format!("failed to write pdf scratch file {}", scratch_path.display()))?;

    let output = Command::new("pdftotext")
        .arg("-enc")
        .arg("UTF-8")
        .arg(&scratch_path)
        .arg("-")
        .output();

    let _ = fs::remove_file(&scratch_path);

    let output = output.context("failed to execute pdftotext")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("pdftotext returned non-zero exit status: {}", stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .replace('\u{0000}', "")
        .replace('\u{000C}', "\n"))
}
