use serde::{Deserialize, Serialize};

use crate::model::{AlignmentVerdict, ConsensusVerdict, StatementKind, StatementRecord};
use crate::titles::{TitleMatchResult, f1_score};
use crate::util::ratio;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportMetrics {
    pub report_id: String,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
    pub reference_count: Option<usize>,
    pub ground_truth_count: Option<usize>,
    pub true_positives: Option<usize>,
    pub false_positives: Option<usize>,
    pub false_negatives: Option<usize>,
    pub total_statements: usize,
    pub cited_statement_count: usize,
    pub located_count: usize,
    pub aligned_count: usize,
    pub misaligned_count: usize,
    pub unverifiable_count: usize,
    pub citation_match_rate: Option<f64>,
    pub alignment_rate: Option<f64>,
    pub non_cited_statement_count: usize,
    pub supported_count: usize,
    pub unsupported_count: usize,
    pub indeterminate_count: usize,
    pub non_cited_accuracy: Option<f64>,
}

/// Scores one report from its statement records and, when ground truth was
/// available, its title-match result.
pub fn report_metrics(
    report_id: &str,
    records: &[StatementRecord],
    titles: Option<&TitleMatchResult>,
) -> ReportMetrics {
    let mut cited_statement_count = 0;
    let mut located_count = 0;
    let mut aligned_count = 0;
    let mut misaligned_count = 0;
    let mut unverifiable_count = 0;
    let mut non_cited_statement_count = 0;
    let mut supported_count = 0;
    let mut unsupported_count = 0;
    let mut indeterminate_count = 0;

    for record in records {
        match record.statement.kind {
            StatementKind::Cited => {
                cited_statement_count += 1;
                let alignment = record.alignment.as_ref();
                if alignment.is_some_and(|outcome| outcome.evidence.is_some()) {
                    located_count += 1;
                }
                match alignment.map(|outcome| outcome.verdict) {
                    Some(AlignmentVerdict::Aligned) => aligned_count += 1,
                    Some(AlignmentVerdict::Misaligned) => misaligned_count += 1,
                    Some(AlignmentVerdict::Unverifiable) | None => unverifiable_count += 1,
                }
            }
            StatementKind::NonCited => {
                non_cited_statement_count += 1;
                match record.consensus.as_ref().map(|outcome| outcome.verdict) {
                    Some(ConsensusVerdict::Supported) => supported_count += 1,
                    Some(ConsensusVerdict::Unsupported) => unsupported_count += 1,
                    Some(ConsensusVerdict::Indeterminate) | None => indeterminate_count += 1,
                }
            }
        }
    }

    ReportMetrics {
        report_id: report_id.to_string(),
        precision: titles.and_then(|result| result.precision),
        recall: titles.and_then(|result| result.recall),
        f1: titles.and_then(|result| result.f1),
        reference_count: titles.map(|result| result.report_titles),
        ground_truth_count: titles.map(|result| result.ground_truth_titles),
        true_positives: titles.map(|result| result.true_positives),
        false_positives: titles.map(|result| result.false_positives),
        false_negatives: titles.map(|result| result.false_negatives),
        total_statements: records.len(),
        cited_statement_count,
        located_count,
        aligned_count,
        misaligned_count,
        unverifiable_count,
        citation_match_rate: ratio(located_count, cited_statement_count),
        alignment_rate: ratio(aligned_count, cited_statement_count),
        non_cited_statement_count,
        supported_count,
        unsupported_count,
        indeterminate_count,
        non_cited_accuracy: ratio(supported_count, non_cited_statement_count),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationMode {
    Mean,
    Weighted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusMetrics {
    pub mode: AggregationMode,
    pub reports: usize,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f1: Option<f64>,
    pub avg_references: Option<f64>,
    pub citation_match_rate: Option<f64>,
    pub alignment_rate: Option<f64>,
    pub avg_cited_statements: Option<f64>,
    pub non_cited_accuracy: Option<f64>,
    pub avg_non_cited_statements: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CorpusSummary {
    NoData,
    Summary(CorpusMetrics),
}

fn mean(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
    let defined: Vec<f64> = values.flatten().collect();
    if defined.is_empty() {
        None
    } else {
        Some(defined.iter().sum::<f64>() / defined.len() as f64)
    }
}

fn pooled(
    reports: &[ReportMetrics],
    numerator: impl Fn(&ReportMetrics) -> Option<usize>,
    denominator: impl Fn(&ReportMetrics) -> Option<usize>,
) -> Option<f64> {
    let numerator_sum: usize = reports.iter().filter_map(&numerator).sum();
    let denominator_sum: usize = reports.iter().filter_map(&denominator).sum();
    ratio(numerator_sum, denominator_sum)
}

/// Corpus figures: per-report mean of each defined metric, or pooled ratios
/// when `mode` is weighted. Zero reports give `NoData`.
pub fn aggregate_reports(reports: &[ReportMetrics], mode: AggregationMode) -> CorpusSummary {
    if reports.is_empty() {
        return CorpusSummary::NoData;
    }

    let avg_references = mean(reports.iter().map(|m| m.reference_count.map(|n| n as f64)));
    let avg_cited_statements = mean(reports.iter().map(|m| Some(m.cited_statement_count as f64)));
    let avg_non_cited_statements =
        mean(reports.iter().map(|m| Some(m.non_cited_statement_count as f64)));

    let metrics = match mode {
        AggregationMode::Mean => CorpusMetrics {
            mode,
            reports: reports.len(),
            precision: mean(reports.iter().map(|m| m.precision)),
            recall: mean(reports.iter().map(|m| m.recall)),
            f1: mean(reports.iter().map(|m| m.f1)),
            avg_references,
            citation_match_rate: mean(reports.iter().map(|m| m.citation_match_rate)),
            alignment_rate: mean(reports.iter().map(|m| m.alignment_rate)),
            avg_cited_statements,
            non_cited_accuracy: mean(reports.iter().map(|m| m.non_cited_accuracy)),
            avg_non_cited_statements,
        },
        AggregationMode::Weighted => {
            let precision = pooled(
                reports,
                |m| m.true_positives,
                |m| Some(m.true_positives? + m.false_positives?),
            );
            let recall = pooled(
                reports,
                |m| m.true_positives,
                |m| Some(m.true_positives? + m.false_negatives?),
            );
            CorpusMetrics {
                mode,
                reports: reports.len(),
                precision,
                recall,
                f1: f1_score(precision, recall),
                avg_references,
                citation_match_rate: pooled(
                    reports,
                    |m| Some(m.located_count),
                    |m| Some(m.cited_statement_count),
                ),
                alignment_rate: pooled(
                    reports,
                    |m| Some(m.aligned_count),
                    |m| Some(m.cited_statement_count),
                ),
                avg_cited_statements,
                non_cited_accuracy: pooled(
                    reports,
                    |m| Some(m.supported_count),
                    |m| Some(m.non_cited_statement_count),
                ),
                avg_non_cited_statements,
            }
        }
    };

    CorpusSummary::Summary(metrics)
}
