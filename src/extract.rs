use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use regex::Regex;
use tracing::{debug, info, warn};
use unicode_segmentation::UnicodeSegmentation;

use crate::judge::{JudgeService, parse_json_object, verdict_flag};
use crate::model::{CitationMarker, Report, Statement, StatementKind};
use crate::references::{clean_url, extract_urls, reference_section_start};

const MAX_RANGE_SPAN: u32 = 50;
const URL_MASK_OPEN: char = '\u{E000}';
const URL_MASK_CLOSE: char = '\u{E001}';
const ABBREVIATIONS: &[&str] = &["et al.", "e.g.", "i.e.", "Fig.", "fig.", "vs.", "Eq.", "No."];

static NUMBERED_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\^?(\d+(?:\s*[-–,]\s*\^?\d+)*)\]").expect("numbered marker regex is valid")
});

static INLINE_LINK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\]]*)\]\((https?://[^\s)]+)\)").expect("inline link regex is valid")
});

static BARE_URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"https?://[^\s\)\]"'>]+"#).expect("bare url regex is valid")
});

static LIST_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:[-*+]|\d+[.)])\s+(.*)$").expect("list item regex is valid")
});

/// A sentence-level unit before classification and filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub text: String,
    pub markers: Vec<CitationMarker>,
}

/// Decides whether an uncited sentence is a checkable factual claim.
#[async_trait]
pub trait StatementFilter: Send + Sync {
    fn name(&self) -> &str;

    async fn keep(&self, sentence: &str) -> bool;
}

/// Cheap stand-in for the model filter: drops questions, lead-ins and
/// fragments too short to assert anything.
#[derive(Debug, Clone)]
pub struct HeuristicFilter {
    pub min_words: usize,
}

impl Default for HeuristicFilter {
    fn default() -> Self {
        Self { min_words: 6 }
    }
}

impl HeuristicFilter {
    pub fn accepts(&self, sentence: &str) -> bool {
        let claim = strip_markers(sentence);
        let trimmed = claim.trim();
        if trimmed.ends_with('?') || trimmed.ends_with(':') {
            return false;
        }
        let words = trimmed.unicode_words().count();
        if words < self.min_words {
            return false;
        }

        let lowered = trimmed.to_lowercase();
        const LEAD_INS: &[&str] = &[
            "in this report",
            "in this survey",
            "this report",
            "this survey",
            "in conclusion",
            "in summary",
            "we will",
            "let us",
        ];
        !LEAD_INS.iter().any(|lead_in| lowered.starts_with(lead_in))
    }
}

#[async_trait]
impl StatementFilter for HeuristicFilter {
    fn name(&self) -> &str {
        "heuristic"
    }

    async fn keep(&self, sentence: &str) -> bool {
        self.accepts(sentence)
    }
}

pub struct LlmStatementFilter {
    judge: Arc<dyn JudgeService>,
    fallback: HeuristicFilter,
}

impl LlmStatementFilter {
    pub fn new(judge: Arc<dyn JudgeService>) -> Self {
        Self {
            judge,
            fallback: HeuristicFilter::default(),
        }
    }
}

#[async_trait]
impl StatementFilter for LlmStatementFilter {
    fn name(&self) -> &str {
        self.judge.name()
    }

    async fn keep(&self, sentence: &str) -> bool {
        let prompt = filter_prompt(&strip_markers(sentence));
        let reply = match self.judge.complete(&prompt).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(error = %err, "statement filter call failed; using heuristic");
                return self.fallback.accepts(sentence);
            }
        };

        match parse_json_object(&reply)
            .ok()
            .and_then(|map| verdict_flag(&map, &["decision"]))
        {
            Some(keep) => keep,
            None => {
                warn!("statement filter reply unreadable; using heuristic");
                self.fallback.accepts(sentence)
            }
        }
    }
}

fn filter_prompt(sentence: &str) -> String {
    format!(
        "Decide whether the sentence below, taken from a research report, is a specific factual \
claim that could be checked against external sources.\n\
Answer false for opinions, analysis, subjective interpretation, common knowledge, and vague or \
general remarks.\n\n\
[Sentence]:\n{sentence}\n\n\
Respond with JSON containing:\n  \"reason\": one short sentence\n  \"decision\": true or false\n\
Return ONLY the JSON."
    )
}

/// Splits a report into classified statements. Uncited sentences only
/// survive if `filter` keeps them; up to `concurrency` filter calls run at
/// once and statement order follows the text.
pub async fn extract(
    report: &Report,
    filter: &dyn StatementFilter,
    concurrency: usize,
) -> Vec<Statement> {
    let decisions: Vec<(Segment, bool)> = stream::iter(segment(&report.text))
        .map(|segment| async move {
            let keep = !segment.markers.is_empty() || filter.keep(&segment.text).await;
            (segment, keep)
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let mut statements = Vec::with_capacity(decisions.len());
    let mut dropped = 0usize;
    for (segment, keep) in decisions {
        if !keep {
            dropped += 1;
            continue;
        }
        let kind = if segment.markers.is_empty() {
            StatementKind::NonCited
        } else {
            StatementKind::Cited
        };

        let position = statements.len();
        statements.push(Statement {
            id: format!("{}-s{:04}", report.id, position + 1),
            position,
            text: segment.text,
            kind,
            markers: segment.markers,
        });
    }

    info!(
        report_id = %report.id,
        statements = statements.len(),
        filtered_out = dropped,
        filter = %filter.name(),
        "extracted statements"
    );
    statements
}

/// Deterministic sentence segmentation of the report body.
pub fn segment(text: &str) -> Vec<Segment> {
    let body = match reference_section_start(text) {
        Some(start) => &text[..start],
        None => text,
    };

    let mut segments = Vec::new();
    for block in prose_blocks(body) {
        let (masked, urls) = mask_urls(&block);
        let mut sentences: Vec<String> = Vec::new();
        for sentence in masked.unicode_sentences() {
            let sentence = unmask_urls(sentence.trim(), &urls);
            let sentence = sentence.as_str();
            if sentence.is_empty() {
                continue;
            }
            match sentences.last_mut() {
                Some(previous) if is_marker_only(sentence) || ends_with_abbreviation(previous) => {
                    previous.push(' ');
                    previous.push_str(sentence);
                }
                _ => sentences.push(sentence.to_string()),
            }
        }

        for sentence in sentences {
            if !strip_markers(&sentence).chars().any(char::is_alphabetic) {
                continue;
            }
            let markers = find_markers(&sentence);
            segments.push(Segment {
                text: sentence,
                markers,
            });
        }
    }

    debug!(segments = segments.len(), "segmented report text");
    segments
}

// URLs hide behind placeholders while splitting so that `.` and `?` inside
// them are not taken as sentence ends.
fn mask_urls(block: &str) -> (String, Vec<String>) {
    let mut urls = Vec::new();
    let masked = BARE_URL_RE
        .replace_all(block, |captures: &regex::Captures| {
            let raw = &captures[0];
            let url = clean_url(raw);
            let suffix = &raw[url.len()..];
            urls.push(url);
            format!("{URL_MASK_OPEN}{}{URL_MASK_CLOSE}{suffix}", urls.len() - 1)
        })
        .into_owned();
    (masked, urls)
}

fn unmask_urls(sentence: &str, urls: &[String]) -> String {
    let mut restored = sentence.to_string();
    for (index, url) in urls.iter().enumerate() {
        restored = restored.replace(&format!("{URL_MASK_OPEN}{index}{URL_MASK_CLOSE}"), url);
    }
    restored
}

fn prose_blocks(body: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut in_fence = false;

    let flush = |current: &mut String, blocks: &mut Vec<String>| {
        if !current.trim().is_empty() {
            blocks.push(std::mem::take(current));
        }
        current.clear();
    };

    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            flush(&mut current, &mut blocks);
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            continue;
        }
        if trimmed.is_empty() || is_heading(trimmed) || trimmed.starts_with('|') || is_rule(trimmed)
        {
            flush(&mut current, &mut blocks);
            continue;
        }

        let content = trimmed.trim_start_matches('>').trim();
        if let Some(captures) = LIST_ITEM_RE.captures(content) {
            flush(&mut current, &mut blocks);
            current.push_str(captures.get(1).map_or("", |item| item.as_str()));
            continue;
        }

        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(content);
    }
    flush(&mut current, &mut blocks);

    blocks
}

fn is_heading(line: &str) -> bool {
    if line.starts_with('#') {
        return true;
    }
    // A bold-only line such as `**Background**` acts as a heading.
    line.len() > 4
        && line.starts_with("**")
        && line.ends_with("**")
        && !line[2..line.len() - 2].contains("**")
        && !line.trim_end_matches('*').ends_with('.')
}

fn is_rule(line: &str) -> bool {
    line.len() >= 3
        && line
            .chars()
            .all(|ch| matches!(ch, '-' | '*' | '_' | '=' | ' '))
}

fn is_marker_only(sentence: &str) -> bool {
    !strip_markers(sentence).chars().any(char::is_alphanumeric)
        && !find_markers(sentence).is_empty()
}

fn ends_with_abbreviation(sentence: &str) -> bool {
    let trimmed = sentence.trim_end();
    ABBREVIATIONS
        .iter()
        .any(|abbreviation| trimmed.ends_with(abbreviation))
}

/// Citation markers in order of first appearance, ranges expanded.
pub fn find_markers(sentence: &str) -> Vec<CitationMarker> {
    let mut found: Vec<(usize, CitationMarker)> = Vec::new();

    for captures in INLINE_LINK_RE.captures_iter(sentence) {
        let (Some(whole), Some(url)) = (captures.get(0), captures.get(2)) else {
            continue;
        };
        found.push((
            whole.start(),
            CitationMarker::InlineUrl {
                url: clean_url(url.as_str()),
            },
        ));
    }

    for captures in NUMBERED_MARKER_RE.captures_iter(sentence) {
        let (Some(whole), Some(label)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        // `[1](https://...)` is a link, already collected above.
        if sentence[whole.end()..].starts_with('(') {
            continue;
        }
        for number in expand_label(label.as_str()) {
            found.push((whole.start(), CitationMarker::numbered(number.to_string())));
        }
    }

    let without_links = INLINE_LINK_RE.replace_all(sentence, |captures: &regex::Captures| {
        " ".repeat(captures[0].len())
    });
    for url in BARE_URL_RE.find_iter(&without_links) {
        let cleaned = clean_url(url.as_str());
        if extract_urls(&cleaned).is_empty() {
            continue;
        }
        found.push((url.start(), CitationMarker::InlineUrl { url: cleaned }));
    }

    found.sort_by_key(|(position, _)| *position);
    let mut seen = HashSet::new();
    found
        .into_iter()
        .map(|(_, marker)| marker)
        .filter(|marker| seen.insert(marker.clone()))
        .collect()
}

fn expand_label(label: &str) -> Vec<u32> {
    let mut numbers = Vec::new();
    for part in label.split(',') {
        let part = part.trim().trim_start_matches('^');
        let bounds: Vec<u32> = part
            .split(['-', '–'])
            .filter_map(|bound| bound.trim().trim_start_matches('^').parse().ok())
            .collect();
        match bounds.as_slice() {
            [single] => numbers.push(*single),
            [start, end] if start <= end && end - start <= MAX_RANGE_SPAN => {
                numbers.extend(*start..=*end)
            }
            [start, end] => {
                numbers.push(*start);
                numbers.push(*end);
            }
            _ => {}
        }
    }
    numbers
}

/// Claim text with citation markers and URLs removed, for judge prompts.
pub fn strip_markers(sentence: &str) -> String {
    let without_links = INLINE_LINK_RE.replace_all(sentence, "$1");
    let without_numbers = NUMBERED_MARKER_RE.replace_all(&without_links, "");
    let without_urls = BARE_URL_RE.replace_all(&without_numbers, "");
    without_urls
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
        .replace(" .", ".")
        .replace(" ,", ",")
        .replace("()", "")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::judge::JudgeError;
    use crate::judge::stubs::ScriptedJudge;

    fn report(text: &str) -> Report {
        Report {
            id: "2401.00001".to_string(),
            source_file: "2401.00001.json".to_string(),
            text: text.to_string(),
            references: Vec::new(),
        }
    }

    struct KeepAll;

    #[async_trait]
    impl StatementFilter for KeepAll {
        fn name(&self) -> &str {
            "keep-all"
        }

        async fn keep(&self, _sentence: &str) -> bool {
            true
        }
    }

    struct KeepNone;

    #[async_trait]
    impl StatementFilter for KeepNone {
        fn name(&self) -> &str {
            "keep-none"
        }

        async fn keep(&self, _sentence: &str) -> bool {
            false
        }
    }

    const SURVEY: &str = "\
# Efficient Transformers

## Background

Transformers replaced recurrent networks for translation [1]. Sparse attention reduces the \
quadratic cost [2-4]. The field is exciting.
Linear attention was proposed in 2020. [5]

| Model | Year |
|---|---|
| Reformer | 2020 |

```python
print('not a claim [9]')
```

- Performer approximates softmax kernels with random features [^6].
- See [the blog post](https://example.com/post?utm_source=x) for benchmarks.

Longformer was released by AllenAI https://arxiv.org/abs/2004.05150.

## References
[1] Attention Is All You Need
";

    #[test]
    fn segmentation_skips_structure_and_reference_section() {
        let segments = segment(SURVEY);
        let texts: Vec<&str> = segments.iter().map(|segment| segment.text.as_str()).collect();

        assert!(texts.iter().all(|text| !text.contains("not a claim")));
        assert!(texts.iter().all(|text| !text.contains("Reformer")));
        assert!(texts.iter().all(|text| !text.contains("Attention Is All You Need")));
        assert!(texts.iter().all(|text| !text.starts_with('#')));
        assert_eq!(segments.len(), 7);
    }

    #[test]
    fn marker_only_fragment_attaches_to_previous_sentence() {
        let segments = segment(SURVEY);
        let linear = segments
            .iter()
            .find(|segment| segment.text.starts_with("Linear attention"))
            .expect("linear attention sentence should exist");
        assert_eq!(linear.text, "Linear attention was proposed in 2020. [5]");
        assert_eq!(linear.markers, vec![CitationMarker::numbered("5")]);
    }

    #[test]
    fn markers_cover_ranges_footnotes_links_and_bare_urls() {
        assert_eq!(
            find_markers("Sparse attention reduces the quadratic cost [2-4]."),
            vec![
                CitationMarker::numbered("2"),
                CitationMarker::numbered("3"),
                CitationMarker::numbered("4"),
            ]
        );
        assert_eq!(
            find_markers("Two sources agree [1, 3][^7]."),
            vec![
                CitationMarker::numbered("1"),
                CitationMarker::numbered("3"),
                CitationMarker::numbered("7"),
            ]
        );
        assert_eq!(
            find_markers("See [the post](https://example.com/p) and https://b.org/x."),
            vec![
                CitationMarker::InlineUrl {
                    url: "https://example.com/p".to_string()
                },
                CitationMarker::InlineUrl {
                    url: "https://b.org/x".to_string()
                },
            ]
        );
        assert!(find_markers("No citation in 2020 at all.").is_empty());
    }

    #[test]
    fn strip_markers_leaves_plain_claim() {
        assert_eq!(
            strip_markers("Sparse attention reduces cost [2-4]. See [the post](https://x.org/p)."),
            "Sparse attention reduces cost. See the post."
        );
    }

    #[tokio::test]
    async fn cited_plus_non_cited_equals_total_after_filtering() {
        let report = report(SURVEY);
        let kept = extract(&report, &KeepAll, 4).await;
        let cited = kept
            .iter()
            .filter(|statement| statement.kind == StatementKind::Cited)
            .count();
        let non_cited = kept
            .iter()
            .filter(|statement| statement.kind == StatementKind::NonCited)
            .count();
        assert_eq!(cited + non_cited, kept.len());
        assert_eq!(cited, 6);
        assert_eq!(non_cited, 1);

        let filtered = extract(&report, &KeepNone, 4).await;
        assert_eq!(filtered.len(), cited);
        assert!(
            filtered
                .iter()
                .all(|statement| statement.kind == StatementKind::Cited && !statement.markers.is_empty())
        );
        assert_eq!(filtered[0].id, "2401.00001-s0001");
        assert_eq!(filtered[5].position, 5);
    }

    #[test]
    fn heuristic_filter_drops_questions_and_short_fragments() {
        let filter = HeuristicFilter::default();
        assert!(filter.accepts("GPT-3 has 175 billion parameters and was released in 2020."));
        assert!(!filter.accepts("The field is exciting."));
        assert!(!filter.accepts("What makes attention so effective for language tasks?"));
        assert!(!filter.accepts("In this report we review efficient attention mechanisms."));
    }

    #[tokio::test]
    async fn llm_filter_follows_decision_and_falls_back_on_error() {
        let rejecting = LlmStatementFilter::new(Arc::new(ScriptedJudge::always(
            "filter",
            "{\"reason\": \"opinion\", \"decision\": false}",
        )));
        assert!(
            !rejecting
                .keep("GPT-3 has 175 billion parameters and was released in 2020.")
                .await
        );

        let failing = LlmStatementFilter::new(Arc::new(ScriptedJudge::failing(
            "filter",
            JudgeError::Timeout,
        )));
        assert!(
            failing
                .keep("GPT-3 has 175 billion parameters and was released in 2020.")
                .await
        );
    }

    struct SlowFilter {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl StatementFilter for SlowFilter {
        fn name(&self) -> &str {
            "slow"
        }

        async fn keep(&self, _sentence: &str) -> bool {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            true
        }
    }

    #[tokio::test]
    async fn filter_calls_overlap_and_keep_text_order() {
        let text = (1..=8)
            .map(|n| format!("Model number {n} was trained on a large web corpus in 2023."))
            .collect::<Vec<_>>()
            .join(" ");
        let filter = SlowFilter {
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        };

        let statements = extract(&report(&text), &filter, 4).await;

        assert_eq!(statements.len(), 8);
        assert!(filter.peak.load(Ordering::SeqCst) > 1);
        assert!(filter.peak.load(Ordering::SeqCst) <= 4);
        assert!(statements[0].text.starts_with("Model number 1 "));
        assert!(statements[7].text.starts_with("Model number 8 "));
        assert_eq!(statements[7].position, 7);
    }
}
