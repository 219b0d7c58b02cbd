use std::sync::LazyLock;

use futures::future::join_all;
use regex::Regex;
use tracing::debug;

use crate::model::{CitationMarker, ReferenceEntry, ResolutionStatus, ResolvedSource};
use crate::urls::{UrlCache, normalize, url_id};
use crate::util::sha256_hex;

static SECTION_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^[ \t]{0,3}(?:#{1,6}[ \t]*)?(?:\*\*)?[ \t]*(?:references|sources|bibliography|works cited|citations|参考文献)[ \t]*(?:\*\*)?[ \t]*:?(?:\*\*)?[ \t]*$",
    )
    .expect("reference heading regex is valid")
});

static ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*+]\s+)?(?:\[\^?(\d+)\]:?|(\d{1,3})[.)](?:\s|$))\s*(.*)$")
        .expect("reference entry regex is valid")
});

static UNNUMBERED_ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*[-*+]\s+(.+)$").expect("bullet entry regex is valid")
});

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s\)\]"'>]+"#).expect("url regex is valid")
});

static MARKDOWN_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\]]+)\]\((https?://[^\s)]+)\)").expect("markdown link regex is valid")
});

static QUOTED_TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"["“]([^"”]{8,})["”]"#).expect("quoted title regex is valid")
});

static LINK_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:available at|retrieved from|url)\s*:?\s*$").expect("link label regex is valid")
});

const TITLE_TRIM: &[char] = &[
    ' ', '.', ',', ';', ':', '-', '–', '—', '*', '_', '"', '\'', '“', '”', '<', '>', '(', ')',
];

/// Byte offset of the last References/Sources/Bibliography heading.
pub fn reference_section_start(text: &str) -> Option<usize> {
    SECTION_HEADING_RE
        .find_iter(text)
        .last()
        .map(|heading| heading.start())
}

pub fn extract_urls(text: &str) -> Vec<String> {
    URL_RE
        .find_iter(text)
        .map(|found| clean_url(found.as_str()))
        .filter(|url| url.len() > "https://".len())
        .collect()
}

pub fn clean_url(raw: &str) -> String {
    raw.trim_end_matches(['.', ',', ';', ':']).to_string()
}

/// Recovers `{marker, title, url}` entries from the trailing reference section.
pub fn parse_reference_list(text: &str) -> Vec<ReferenceEntry> {
    let Some(start) = reference_section_start(text) else {
        return Vec::new();
    };
    let section = &text[start..];

    let mut entries: Vec<ReferenceEntry> = Vec::new();
    for line in section.lines().skip(1) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with('#') {
            break;
        }

        if let Some(captures) = ENTRY_RE.captures(trimmed) {
            let marker = captures
                .get(1)
                .or_else(|| captures.get(2))
                .map(|found| found.as_str().to_string())
                .unwrap_or_default();
            let body = captures.get(3).map(|found| found.as_str()).unwrap_or_default();
            let (title, url) = split_reference_line(body);
            entries.push(ReferenceEntry { marker, title, url });
            continue;
        }

        if let Some(captures) = UNNUMBERED_ENTRY_RE.captures(trimmed) {
            let (title, url) = split_reference_line(&captures[1]);
            entries.push(ReferenceEntry {
                marker: (entries.len() + 1).to_string(),
                title,
                url,
            });
            continue;
        }

        // Wrapped lines belong to the previous entry.
        if let Some(previous) = entries.last_mut() {
            let (title, url) = split_reference_line(trimmed);
            if previous.url.is_none() {
                previous.url = url;
            }
            if previous.title.is_none() {
                previous.title = title;
            }
        }
    }

    debug!(entries = entries.len(), "parsed reference section");
    entries
}

pub fn split_reference_line(body: &str) -> (Option<String>, Option<String>) {
    if let Some(captures) = MARKDOWN_LINK_RE.captures(body) {
        let title = clean_title(&captures[1]);
        let url = clean_url(&captures[2]);
        // `[https://x](https://x)` carries no title.
        let title = title.filter(|value| !value.starts_with("http"));
        return (title.or_else(|| quoted_title(body)), Some(url));
    }

    let url = extract_urls(body).into_iter().next();
    if let Some(title) = quoted_title(body) {
        return (Some(title), url);
    }

    let without_url = URL_RE.replace_all(body, "");
    let without_labels = LINK_LABEL_RE.replace_all(&without_url, "");
    (clean_title(&without_labels), url)
}

fn quoted_title(body: &str) -> Option<String> {
    QUOTED_TITLE_RE
        .captures(body)
        .and_then(|captures| clean_title(&captures[1]))
}

fn clean_title(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<&str>>().join(" ");
    let trimmed = collapsed.trim_matches(TITLE_TRIM);
    if trimmed.chars().any(char::is_alphanumeric) {
        Some(trimmed.to_string())
    } else {
        None
    }
}

/// Where a marker points before anything is fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceTarget {
    Missing,
    TitleOnly { title: Option<String> },
    Url { url: String, title: Option<String> },
}

pub fn resolve_target(marker: &CitationMarker, references: &[ReferenceEntry]) -> SourceTarget {
    match marker {
        CitationMarker::Numbered { label } => {
            match references.iter().find(|entry| entry.marker == *label) {
                None => SourceTarget::Missing,
                Some(entry) => match &entry.url {
                    Some(url) => SourceTarget::Url {
                        url: url.clone(),
                        title: entry.title.clone(),
                    },
                    None => SourceTarget::TitleOnly {
                        title: entry.title.clone(),
                    },
                },
            }
        }
        CitationMarker::InlineUrl { url } => SourceTarget::Url {
            url: url.clone(),
            title: None,
        },
    }
}

/// One `ResolvedSource` per marker, in marker order.
pub async fn resolve_sources(
    markers: &[CitationMarker],
    references: &[ReferenceEntry],
    cache: &UrlCache,
) -> Vec<ResolvedSource> {
    join_all(
        markers
            .iter()
            .map(|marker| resolve_one(marker, resolve_target(marker, references), cache)),
    )
    .await
}

async fn resolve_one(
    marker: &CitationMarker,
    target: SourceTarget,
    cache: &UrlCache,
) -> ResolvedSource {
    match target {
        SourceTarget::Missing => ResolvedSource {
            marker: marker.clone(),
            title: None,
            url: None,
            normalized_url: None,
            url_id: None,
            status: ResolutionStatus::Unresolved,
            text: String::new(),
            text_chars: 0,
            text_sha256: None,
            error: Some(format!(
                "marker {} has no reference entry",
                marker.display_label()
            )),
        },
        SourceTarget::TitleOnly { title } => ResolvedSource {
            marker: marker.clone(),
            title,
            url: None,
            normalized_url: None,
            url_id: None,
            status: ResolutionStatus::Resolved,
            text: String::new(),
            text_chars: 0,
            text_sha256: None,
            error: None,
        },
        SourceTarget::Url { url, title } => {
            let outcome = cache.get_or_fetch(&url).await;
            let fetched = outcome.is_fetched();
            let text_chars = outcome.text.chars().count();
            let text_sha256 = fetched.then(|| sha256_hex(&outcome.text));

            ResolvedSource {
                marker: marker.clone(),
                title: title.or(outcome.title),
                normalized_url: Some(normalize(&url)),
                url_id: Some(url_id(&url)),
                url: Some(url),
                status: if fetched {
                    ResolutionStatus::Resolved
                } else {
                    ResolutionStatus::FetchFailed
                },
                text: outcome.text,
                text_chars,
                text_sha256,
                error: outcome.error,
            }
        }
    }
}
