use std::sync::Arc;

use tracing::{debug, warn};

use crate::extract::strip_markers;
use crate::judge::{JudgeError, JudgeService, parse_json_object, reason_text, verdict_flag};
use crate::model::{AlignmentOutcome, AlignmentVerdict, ResolvedSource, Statement};
use crate::util::truncate_chars;

pub const MAX_SOURCE_CHARS: usize = 262_144;
const NOT_FOUND: &str = "NOT_FOUND";

/// Two-step check of a cited statement: locate a supporting passage in the
/// fetched sources, then ask whether that passage supports the claim.
pub struct AlignmentJudge {
    judge: Arc<dyn JudgeService>,
}

impl AlignmentJudge {
    pub fn new(judge: Arc<dyn JudgeService>) -> Self {
        Self { judge }
    }

    pub async fn judge(&self, statement: &Statement, sources: &[ResolvedSource]) -> AlignmentOutcome {
        let Some(source_text) = combined_source_text(sources) else {
            return unverifiable(no_text_reason(sources));
        };
        let claim = strip_markers(&statement.text);

        let located = match self.judge.complete(&locate_prompt(&claim, &source_text)).await {
            Ok(reply) => reply.trim().to_string(),
            Err(err) => {
                warn!(statement_id = %statement.id, error = %err, "passage lookup failed");
                return unverifiable(format!("passage lookup failed: {err}"));
            }
        };

        if located.is_empty() || located.trim_matches(['"', '`', '.']) == NOT_FOUND {
            debug!(statement_id = %statement.id, "no supporting passage in source");
            return AlignmentOutcome {
                verdict: AlignmentVerdict::Misaligned,
                evidence: None,
                reason: "no passage in the cited source relates to the claim".to_string(),
            };
        }

        let reply = match self.judge.complete(&verify_prompt(&claim, &located)).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!(statement_id = %statement.id, error = %err, "alignment check failed");
                return AlignmentOutcome {
                    verdict: AlignmentVerdict::Unverifiable,
                    evidence: Some(located),
                    reason: format!("alignment check failed: {err}"),
                };
            }
        };

        let parsed = parse_json_object(&reply).and_then(|map| {
            verdict_flag(&map, &["match"])
                .map(|matched| (matched, reason_text(&map)))
                .ok_or_else(|| JudgeError::Malformed("reply has no `match` field".to_string()))
        });

        match parsed {
            Ok((matched, reason)) => AlignmentOutcome {
                verdict: if matched {
                    AlignmentVerdict::Aligned
                } else {
                    AlignmentVerdict::Misaligned
                },
                evidence: Some(located),
                reason,
            },
            Err(err) => {
                warn!(statement_id = %statement.id, error = %err, "alignment reply unreadable");
                AlignmentOutcome {
                    verdict: AlignmentVerdict::Unverifiable,
                    evidence: Some(located),
                    reason: err.to_string(),
                }
            }
        }
    }
}

fn unverifiable(reason: String) -> AlignmentOutcome {
    AlignmentOutcome {
        verdict: AlignmentVerdict::Unverifiable,
        evidence: None,
        reason,
    }
}

fn no_text_reason(sources: &[ResolvedSource]) -> String {
    let errors: Vec<&str> = sources
        .iter()
        .filter_map(|source| source.error.as_deref())
        .collect();
    if errors.is_empty() {
        "cited sources have no retrievable text".to_string()
    } else {
        format!("cited sources have no retrievable text: {}", errors.join("; "))
    }
}

/// Concatenated text of every source that has any, capped in characters.
pub fn combined_source_text(sources: &[ResolvedSource]) -> Option<String> {
    let mut combined = String::new();
    for source in sources.iter().filter(|source| source.has_text()) {
        if !combined.is_empty() {
            combined.push_str("\n\n");
        }
        match &source.title {
            Some(title) => combined.push_str(&format!(
                "[Source {}: {}]\n",
                source.marker.display_label(),
                title
            )),
            None => combined.push_str(&format!("[Source {}]\n", source.marker.display_label())),
        }
        combined.push_str(source.text.trim());
    }

    if combined.is_empty() {
        None
    } else {
        Some(truncate_chars(&combined, MAX_SOURCE_CHARS).to_string())
    }
}

fn locate_prompt(claim: &str, source_text: &str) -> String {
    format!(
        "You are given a statement and a source document.\n\n\
[Statement]: {claim}\n\n\
[Source Document]:\n\"\"\"{source_text}\"\"\"\n\n\
Copy the passage of the source document that relates to the statement. It may be a sentence, \
a paragraph, or the whole text if necessary.\n\
If nothing in the document relates to the statement, reply exactly {NOT_FOUND}.\n\
Reply with plain text only."
    )
}

fn verify_prompt(claim: &str, passage: &str) -> String {
    format!(
        "Decide whether a claim is faithfully supported by a passage taken from its cited source.\n\n\
[Claim]:\n{claim}\n\n\
[Passage]:\n{passage}\n\n\
Respond with JSON containing:\n  \"reason\": one short sentence explaining the decision\n  \
\"match\": true if the passage supports the claim, otherwise false\n\
Return ONLY the JSON."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::stubs::ScriptedJudge;
    use crate::model::{CitationMarker, ResolutionStatus, StatementKind};

    fn statement() -> Statement {
        Statement {
            id: "r-s0001".to_string(),
            position: 0,
            text: "Transformers rely entirely on attention [1].".to_string(),
            kind: StatementKind::Cited,
            markers: vec![CitationMarker::numbered("1")],
        }
    }

    fn source(status: ResolutionStatus, text: &str) -> ResolvedSource {
        ResolvedSource {
            marker: CitationMarker::numbered("1"),
            title: Some("Attention Is All You Need".to_string()),
            url: Some("https://arxiv.org/abs/1706.03762".to_string()),
            normalized_url: Some("https://arxiv.org/abs/1706.03762".to_string()),
            url_id: Some("abc".to_string()),
            status,
            text: text.to_string(),
            text_chars: text.chars().count(),
            text_sha256: None,
            error: (status == ResolutionStatus::FetchFailed)
                .then(|| "http status 503".to_string()),
        }
    }

    #[tokio::test]
    async fn failed_fetch_is_unverifiable_without_judge_calls() {
        let judge = Arc::new(ScriptedJudge::always("aligner", "{\"match\": true}"));
        let aligner = AlignmentJudge::new(judge.clone());

        let outcome = aligner
            .judge(&statement(), &[source(ResolutionStatus::FetchFailed, "")])
            .await;

        assert_eq!(outcome.verdict, AlignmentVerdict::Unverifiable);
        assert!(outcome.reason.contains("http status 503"));
        assert_eq!(judge.call_count(), 0);
    }

    #[tokio::test]
    async fn located_and_confirmed_passage_is_aligned() {
        let judge = Arc::new(ScriptedJudge::new(
            "aligner",
            vec![
                Ok("We propose the Transformer, based solely on attention.".to_string()),
                Ok("```json\n{\"reason\": \"same claim\", \"match\": true}\n```".to_string()),
            ],
        ));
        let aligner = AlignmentJudge::new(judge.clone());

        let outcome = aligner
            .judge(
                &statement(),
                &[source(
                    ResolutionStatus::Resolved,
                    "We propose the Transformer, based solely on attention.",
                )],
            )
            .await;

        assert_eq!(outcome.verdict, AlignmentVerdict::Aligned);
        assert_eq!(
            outcome.evidence.as_deref(),
            Some("We propose the Transformer, based solely on attention.")
        );
        assert_eq!(outcome.reason, "same claim");
        assert_eq!(judge.call_count(), 2);
    }

    #[tokio::test]
    async fn not_found_passage_is_misaligned() {
        let judge = Arc::new(ScriptedJudge::always("aligner", "NOT_FOUND"));
        let aligner = AlignmentJudge::new(judge.clone());

        let outcome = aligner
            .judge(&statement(), &[source(ResolutionStatus::Resolved, "Unrelated recipe text.")])
            .await;

        assert_eq!(outcome.verdict, AlignmentVerdict::Misaligned);
        assert_eq!(judge.call_count(), 1);
    }

    #[tokio::test]
    async fn judge_errors_and_malformed_replies_are_unverifiable() {
        let failing = AlignmentJudge::new(Arc::new(ScriptedJudge::failing(
            "aligner",
            JudgeError::Timeout,
        )));
        let outcome = failing
            .judge(&statement(), &[source(ResolutionStatus::Resolved, "text")])
            .await;
        assert_eq!(outcome.verdict, AlignmentVerdict::Unverifiable);

        let rambling = AlignmentJudge::new(Arc::new(ScriptedJudge::new(
            "aligner",
            vec![Ok("a passage".to_string()), Ok("I think so".to_string())],
        )));
        let outcome = rambling
            .judge(&statement(), &[source(ResolutionStatus::Resolved, "a passage")])
            .await;
        assert_eq!(outcome.verdict, AlignmentVerdict::Unverifiable);
        assert_eq!(outcome.evidence.as_deref(), Some("a passage"));
    }

    #[test]
    fn combined_text_is_capped() {
        let long = "x".repeat(MAX_SOURCE_CHARS + 10);
        let combined = combined_source_text(&[source(ResolutionStatus::Resolved, &long)])
            .expect("resolved text should be combined");
        assert_eq!(combined.chars().count(), MAX_SOURCE_CHARS);
    }
}
