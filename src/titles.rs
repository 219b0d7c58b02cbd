use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::util::ratio;

pub const DEFAULT_TITLE_THRESHOLD: f64 = 0.8;

/// Lower-cases, drops punctuation and collapses whitespace.
pub fn normalize_title(title: &str) -> String {
    title
        .to_lowercase()
        .chars()
        .filter(|ch| {
            !ch.is_ascii_punctuation() && !matches!(ch, '“' | '”' | '‘' | '’' | '–' | '—' | '…')
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
}

fn token_set(normalized: &str) -> BTreeSet<&str> {
    normalized.split_whitespace().collect()
}

/// Token-set overlap `|A ∩ B| / max(|A|, |B|)` of two normalized titles.
pub fn overlap(left: &str, right: &str) -> f64 {
    let left = token_set(left);
    let right = token_set(right);
    let larger = left.len().max(right.len());
    if larger == 0 {
        return 0.0;
    }
    left.intersection(&right).count() as f64 / larger as f64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleMatch {
    pub report_title: String,
    pub ground_truth_index: usize,
    pub ground_truth_title: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TitleMatchResult {
    pub threshold: f64,
    pub report_titles: usize,
    pub ground_truth_titles: usize,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
    pub matches: Vec<TitleMatch>,
    pub unmatched_report_titles: Vec<String>,
    pub unmatched_ground_truth_titles: Vec<String>,
}

pub fn f1_score(precision: Option<f64>, recall: Option<f64>) -> Option<f64> {
    let (precision, recall) = (precision?, recall?);
    if precision + recall == 0.0 {
        Some(0.0)
    } else {
        Some(2.0 * precision * recall / (precision + recall))
    }
}

fn dedup_normalized<'a>(titles: impl IntoIterator<Item = &'a str>) -> Vec<(String, String)> {
    let mut seen = HashSet::new();
    titles
        .into_iter()
        .filter_map(|title| {
            let normalized = normalize_title(title);
            if normalized.is_empty() || !seen.insert(normalized.clone()) {
                None
            } else {
                Some((title.trim().to_string(), normalized))
            }
        })
        .collect()
}

/// Greedy one-to-one assignment of report titles to ground-truth titles, in
/// report order. Among candidates at or above `threshold` the best score wins,
/// then a not-yet-matched entry, then the lowest ground-truth index. A report
/// title whose candidates are all taken counts as a false positive.
pub fn match_titles(
    report_titles: &[String],
    ground_truth_titles: &[String],
    threshold: f64,
) -> TitleMatchResult {
    let report = dedup_normalized(report_titles.iter().map(String::as_str));
    let truth = dedup_normalized(ground_truth_titles.iter().map(String::as_str));

    let mut taken = vec![false; truth.len()];
    let mut matches = Vec::new();
    let mut unmatched_report_titles = Vec::new();

    for (report_title, report_normalized) in &report {
        let mut candidates: Vec<(usize, f64)> = truth
            .iter()
            .enumerate()
            .map(|(index, (_, truth_normalized))| {
                (index, overlap(report_normalized, truth_normalized))
            })
            .filter(|(_, score)| *score >= threshold)
            .collect();

        candidates.sort_by(|(left_index, left_score), (right_index, right_score)| {
            right_score
                .total_cmp(left_score)
                .then_with(|| taken[*left_index].cmp(&taken[*right_index]))
                .then_with(|| left_index.cmp(right_index))
        });

        match candidates.into_iter().find(|(index, _)| !taken[*index]) {
            Some((index, score)) => {
                taken[index] = true;
                matches.push(TitleMatch {
                    report_title: report_title.clone(),
                    ground_truth_index: index,
                    ground_truth_title: truth[index].0.clone(),
                    score,
                });
            }
            None => unmatched_report_titles.push(report_title.clone()),
        }
    }

    let unmatched_ground_truth_titles: Vec<String> = truth
        .iter()
        .zip(&taken)
        .filter(|(_, taken)| !**taken)
        .map(|((title, _), _)| title.clone())
        .collect();

    let true_positives = matches.len();
    let false_positives = unmatched_report_titles.len();
    let false_negatives = unmatched_ground_truth_titles.len();
    let precision = ratio(true_positives, true_positives + false_positives);
    let recall = ratio(true_positives, true_positives + false_negatives);

    debug!(
        report_titles = report.len(),
        ground_truth_titles = truth.len(),
        true_positives,
        false_positives,
        false_negatives,
        "matched reference titles"
    );

    TitleMatchResult {
        threshold,
        report_titles: report.len(),
        ground_truth_titles: truth.len(),
        true_positives,
        false_positives,
        false_negatives,
        precision,
        recall,
        f1: f1_score(precision, recall),
        matches,
        unmatched_report_titles,
        unmatched_ground_truth_titles,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn titles(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn normalize_title_strips_case_and_punctuation() {
        assert_eq!(
            normalize_title("  BERT: Pre-training of Deep   Bidirectional Transformers. "),
            "bert pretraining of deep bidirectional transformers"
        );
        assert_eq!(normalize_title("“Quoted” — Title"), "quoted title");
    }

    #[test]
    fn overlap_uses_the_larger_token_set() {
        assert_eq!(overlap("a b c d", "a b c d"), 1.0);
        assert_eq!(overlap("a b c d", "a b"), 0.5);
        assert_eq!(overlap("", ""), 0.0);
    }

    #[test]
    fn identical_lists_give_perfect_precision_and_recall() {
        let list = titles(&[
            "Attention Is All You Need",
            "Language Models are Few-Shot Learners",
            "Deep Residual Learning for Image Recognition",
        ]);
        let result = match_titles(&list, &list, DEFAULT_TITLE_THRESHOLD);

        assert_eq!(result.true_positives, 3);
        assert_eq!(result.precision, Some(1.0));
        assert_eq!(result.recall, Some(1.0));
        assert_eq!(result.f1, Some(1.0));
    }

    #[test]
    fn threshold_is_inclusive() {
        let result = match_titles(
            &titles(&["attention is what you need"]),
            &titles(&["Attention is all you need"]),
            0.8,
        );
        assert_eq!(result.true_positives, 1);
        assert_eq!(result.matches[0].score, 0.8);
    }

    #[test]
    fn ties_prefer_unmatched_then_lowest_index_deterministically() {
        let report = titles(&["Deep Learning for Graphs", "Graphs: Deep Learning For"]);
        let truth = titles(&["Deep learning for graphs", "Graphs for deep learning"]);

        let first = match_titles(&report, &truth, DEFAULT_TITLE_THRESHOLD);
        let second = match_titles(&report, &truth, DEFAULT_TITLE_THRESHOLD);

        assert_eq!(first, second);
        assert_eq!(first.matches[0].ground_truth_index, 0);
        assert_eq!(first.matches[1].ground_truth_index, 1);
        assert_eq!(first.false_positives, 0);
    }

    #[test]
    fn exhausted_candidates_count_as_false_positive() {
        let report = titles(&["Deep Learning for Graphs", "Graphs: Deep Learning For"]);
        let truth = titles(&["Deep learning for graphs", "An unrelated survey of compilers"]);

        let result = match_titles(&report, &truth, DEFAULT_TITLE_THRESHOLD);
        assert_eq!(result.true_positives, 1);
        assert_eq!(result.false_positives, 1);
        assert_eq!(result.false_negatives, 1);
        assert_eq!(result.precision, Some(0.5));
        assert_eq!(result.recall, Some(0.5));
        assert_eq!(
            result.unmatched_ground_truth_titles,
            vec!["An unrelated survey of compilers".to_string()]
        );
    }

    #[test]
    fn duplicates_collapse_and_empty_lists_are_undefined() {
        let report = titles(&["Attention Is All You Need", "attention is all you need."]);
        let result = match_titles(&report, &[], DEFAULT_TITLE_THRESHOLD);
        assert_eq!(result.report_titles, 1);
        assert_eq!(result.precision, Some(0.0));
        assert_eq!(result.recall, None);
        assert_eq!(result.f1, None);
    }
}
