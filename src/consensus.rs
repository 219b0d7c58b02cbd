use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use futures::future::join_all;
use tracing::{debug, warn};

use crate::extract::strip_markers;
use crate::judge::{JudgeService, parse_json_object, reason_text, verdict_flag};
use crate::model::{ConsensusOutcome, ConsensusVerdict, JudgeVote, Statement};

/// Majority vote of several independent verifiers over an uncited claim.
pub struct ConsensusChecker {
    verifiers: Vec<Arc<dyn JudgeService>>,
    samples_per_verifier: usize,
    vote_timeout: Duration,
}

impl ConsensusChecker {
    pub fn new(
        verifiers: Vec<Arc<dyn JudgeService>>,
        samples_per_verifier: usize,
        vote_timeout: Duration,
    ) -> Result<Self> {
        let slots = verifiers.len() * samples_per_verifier;
        if slots < 2 {
            bail!("consensus needs at least 2 vote slots, got {slots}");
        }

        Ok(Self {
            verifiers,
            samples_per_verifier,
            vote_timeout,
        })
    }

    pub fn vote_slots(&self) -> usize {
        self.verifiers.len() * self.samples_per_verifier
    }

    pub async fn check(&self, statement: &Statement) -> ConsensusOutcome {
        let prompt = verify_statement_prompt(&strip_markers(&statement.text));

        let ballots = self.verifiers.iter().flat_map(|verifier| {
            (0..self.samples_per_verifier).map(move |sample| (verifier, sample))
        });
        let votes = join_all(
            ballots.map(|(verifier, sample)| self.cast_vote(verifier.as_ref(), sample, &prompt)),
        )
        .await;

        let outcome = aggregate(votes);
        debug!(
            statement_id = %statement.id,
            verdict = ?outcome.verdict,
            support = outcome.support_votes,
            refute = outcome.refute_votes,
            abstain = outcome.abstentions,
            "consensus reached"
        );
        outcome
    }

    async fn cast_vote(&self, verifier: &dyn JudgeService, sample: usize, prompt: &str) -> JudgeVote {
        let abstain = |reason: String| JudgeVote {
            judge: verifier.name().to_string(),
            sample,
            decision: None,
            confidence: None,
            reason,
        };

        let reply = match tokio::time::timeout(self.vote_timeout, verifier.complete(prompt)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                warn!(judge = %verifier.name(), sample, error = %err, "verifier gave no vote");
                return abstain(err.to_string());
            }
            Err(_) => {
                warn!(judge = %verifier.name(), sample, "verifier timed out");
                return abstain("vote timed out".to_string());
            }
        };

        let map = match parse_json_object(&reply) {
            Ok(map) => map,
            Err(err) => return abstain(err.to_string()),
        };
        match verdict_flag(&map, &["decision", "supported"]) {
            Some(decision) => JudgeVote {
                judge: verifier.name().to_string(),
                sample,
                decision: Some(decision),
                confidence: map
                    .get("confidence")
                    .and_then(serde_json::Value::as_f64)
                    .filter(|value| (0.0..=1.0).contains(value)),
                reason: reason_text(&map),
            },
            None => abstain("reply has no `decision` field".to_string()),
        }
    }
}

/// Strict majority of cast votes; a tie, including zero votes, is indeterminate.
pub fn aggregate(votes: Vec<JudgeVote>) -> ConsensusOutcome {
    let support_votes = votes
        .iter()
        .filter(|vote| vote.decision == Some(true))
        .count();
    let refute_votes = votes
        .iter()
        .filter(|vote| vote.decision == Some(false))
        .count();
    let abstentions = votes.len() - support_votes - refute_votes;

    let verdict = match support_votes.cmp(&refute_votes) {
        std::cmp::Ordering::Greater => ConsensusVerdict::Supported,
        std::cmp::Ordering::Less => ConsensusVerdict::Unsupported,
        std::cmp::Ordering::Equal => ConsensusVerdict::Indeterminate,
    };

    ConsensusOutcome {
        verdict,
        support_votes,
        refute_votes,
        abstentions,
        votes,
    }
}

fn verify_statement_prompt(claim: &str) -> String {
    format!(
        "Verify whether the following factual statement is accurate. Consult reliable, \
authoritative sources where you can and weigh what they say.\n\n\
[Statement to verify]:\n{claim}\n\n\
Respond with JSON containing:\n  \"reason\": two or three sentences on how you decided\n  \
\"decision\": true if the statement is correct, false if it is incorrect\n  \
\"confidence\": optional number between 0 and 1\n\
Return ONLY the JSON."
    )
}
