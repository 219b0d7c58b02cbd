use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::cli::MetricsArgs;
use crate::commands::citations::CitationReport;
use crate::commands::manifest::RunRecorder;
use crate::commands::{
    CITATIONS_FILE, CORPUS_METRICS_FILE, CORPUS_SUMMARY_FILE, REPORT_METRICS_FILE,
    STATEMENTS_FILE,
};
use crate::metrics::{AggregationMode, CorpusSummary, ReportMetrics, aggregate_reports, report_metrics};
use crate::model::StatementRecord;
use crate::util::{write_json_pretty, write_jsonl};

pub fn run(args: MetricsArgs) -> Result<()> {
    let report_dirs = list_report_dirs(&args.output_dir)?;
    let mode = if args.weighted {
        AggregationMode::Weighted
    } else {
        AggregationMode::Mean
    };

    let mut recorder = RunRecorder::start("metrics", &args.output_dir, &args.output_dir, report_dirs.len())?;
    let mut rows = Vec::new();
    for dir in &report_dirs {
        match score_report_dir(dir) {
            Ok(Some(metrics)) => {
                rows.push(metrics);
                recorder.record_success();
            }
            Ok(None) => recorder.warn(format!(
                "{} has neither {STATEMENTS_FILE} nor {CITATIONS_FILE}",
                dir.display()
            )),
            Err(err) => recorder.record_failure(dir, report_id_of(dir).as_deref(), &err),
        }
    }

    let summary = write_corpus_outputs(&args.output_dir, &rows, mode)?;
    if matches!(summary, CorpusSummary::NoData) {
        recorder.warn("no scored reports; corpus summary has no data");
    }
    recorder.note(format!("aggregation={mode:?}").to_lowercase());
    recorder.finish()?;
    Ok(())
}

fn list_report_dirs(output_dir: &Path) -> Result<Vec<PathBuf>> {
    if !output_dir.is_dir() {
        bail!("output directory does not exist: {}", output_dir.display());
    }

    let mut dirs = Vec::new();
    for entry in fs::read_dir(output_dir)
        .with_context(|| format!("failed to list {}", output_dir.display()))?
    {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", output_dir.display()))?
            .path();
        if path.is_dir() {
            dirs.push(path);
        }
    }

    dirs.sort();
    Ok(dirs)
}

fn report_id_of(dir: &Path) -> Option<String> {
    dir.file_name()
        .and_then(|name| name.to_str())
        .map(ToOwned::to_owned)
}

/// Scores one `<out>/<id>/` directory and writes its `metrics.json`.
/// Directories with no evaluation output give `None`.
pub fn score_report_dir(dir: &Path) -> Result<Option<ReportMetrics>> {
    let Some(report_id) = report_id_of(dir) else {
        bail!("report directory has no usable name: {}", dir.display());
    };
    let statements_path = dir.join(STATEMENTS_FILE);
    let citations_path = dir.join(CITATIONS_FILE);
    if !statements_path.is_file() && !citations_path.is_file() {
        return Ok(None);
    }

    let records = if statements_path.is_file() {
        read_statement_records(&statements_path)?
    } else {
        warn!(report_id = %report_id, "no statement records; statement metrics are empty");
        Vec::new()
    };

    let citations = if citations_path.is_file() {
        let raw = fs::read(&citations_path)
            .with_context(|| format!("failed to read {}", citations_path.display()))?;
        let report: CitationReport = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", citations_path.display()))?;
        Some(report)
    } else {
        None
    };

    let metrics = report_metrics(
        &report_id,
        &records,
        citations.as_ref().map(|report| &report.result),
    );
    write_json_pretty(&dir.join(REPORT_METRICS_FILE), &metrics)?;
    Ok(Some(metrics))
}

fn read_statement_records(path: &Path) -> Result<Vec<StatementRecord>> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(line_number, line)| {
            serde_json::from_str(line).with_context(|| {
                format!("failed to parse {} line {}", path.display(), line_number + 1)
            })
        })
        .collect()
}

/// Writes `metrics.jsonl` (one row per report) and `summary.json`.
pub fn write_corpus_outputs(
    output_dir: &Path,
    rows: &[ReportMetrics],
    mode: AggregationMode,
) -> Result<CorpusSummary> {
    write_jsonl(&output_dir.join(CORPUS_METRICS_FILE), rows)?;
    let summary = aggregate_reports(rows, mode);
    write_json_pretty(&output_dir.join(CORPUS_SUMMARY_FILE), &summary)?;

    match &summary {
        CorpusSummary::Summary(corpus) => info!(
            reports = corpus.reports,
            precision = ?corpus.precision,
            recall = ?corpus.recall,
            f1 = ?corpus.f1,
            alignment_rate = ?corpus.alignment_rate,
            non_cited_accuracy = ?corpus.non_cited_accuracy,
            "corpus metrics written"
        ),
        CorpusSummary::NoData => warn!(path = %output_dir.display(), "no report metrics to aggregate"),
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        AlignmentOutcome, AlignmentVerdict, CitationMarker, ConsensusOutcome, ConsensusVerdict,
        Statement, StatementKind,
    };
    use crate::titles::match_titles;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "reportbench_metrics_{}_{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("scratch dir should be created");
        dir
    }

    fn cited(id: &str, verdict: AlignmentVerdict) -> StatementRecord {
        StatementRecord {
            statement: Statement {
                id: id.to_string(),
                position: 0,
                text: "Claim [1].".to_string(),
                kind: StatementKind::Cited,
                markers: vec![CitationMarker::numbered("1")],
            },
            sources: Vec::new(),
            alignment: Some(AlignmentOutcome {
                verdict,
                evidence: Some("passage".to_string()),
                reason: String::new(),
            }),
            consensus: None,
        }
    }

    fn uncited(id: &str, verdict: ConsensusVerdict) -> StatementRecord {
        StatementRecord {
            statement: Statement {
                id: id.to_string(),
                position: 1,
                text: "Plain claim.".to_string(),
                kind: StatementKind::NonCited,
                markers: Vec::new(),
            },
            sources: Vec::new(),
            alignment: None,
            consensus: Some(ConsensusOutcome {
                verdict,
                support_votes: 2,
                refute_votes: 0,
                abstentions: 0,
                votes: Vec::new(),
            }),
        }
    }

    #[test]
    fn report_dir_combines_statements_and_citations() {
        let dir = scratch_dir("combined").join("2401.00001");
        let records = vec![
            cited("a", AlignmentVerdict::Aligned),
            cited("b", AlignmentVerdict::Misaligned),
            uncited("c", ConsensusVerdict::Supported),
        ];
        write_jsonl(&dir.join(STATEMENTS_FILE), &records).expect("statements should be written");
        let citations = CitationReport {
            report_id: "2401.00001".to_string(),
            references: Vec::new(),
            paper_checks: Vec::new(),
            result: match_titles(
                &["Attention Is All You Need".to_string()],
                &["attention is all you need".to_string(), "BERT".to_string()],
                0.8,
            ),
        };
        write_json_pretty(&dir.join(CITATIONS_FILE), &citations).expect("citations should be written");

        let metrics = score_report_dir(&dir)
            .expect("dir should score")
            .expect("dir has outputs");

        assert_eq!(metrics.report_id, "2401.00001");
        assert_eq!(metrics.cited_statement_count, 2);
        assert_eq!(metrics.alignment_rate, Some(0.5));
        assert_eq!(metrics.non_cited_accuracy, Some(1.0));
        assert_eq!(metrics.precision, Some(1.0));
        assert_eq!(metrics.recall, Some(0.5));
        assert!(dir.join(REPORT_METRICS_FILE).is_file());

        let _ = fs::remove_dir_all(dir.parent().expect("scratch parent"));
    }

    #[test]
    fn empty_dir_is_skipped_and_corpus_reports_no_data() {
        let root = scratch_dir("empty");
        let dir = root.join("2401.00002");
        fs::create_dir_all(&dir).expect("dir should be created");

        assert!(score_report_dir(&dir).expect("dir should score").is_none());

        let summary = write_corpus_outputs(&root, &[], AggregationMode::Mean)
            .expect("corpus outputs should be written");
        assert_eq!(summary, CorpusSummary::NoData);
        let raw = fs::read_to_string(root.join(CORPUS_SUMMARY_FILE)).expect("summary should exist");
        assert!(raw.contains("no_data"));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn corrupt_statement_rows_fail_the_report() {
        let dir = scratch_dir("corrupt").join("2401.00003");
        fs::create_dir_all(&dir).expect("dir should be created");
        fs::write(dir.join(STATEMENTS_FILE), "{oops\n").expect("file should be written");

        let err = score_report_dir(&dir).expect_err("corrupt rows should fail");
        assert!(err.to_string().contains("line 1"));

        let _ = fs::remove_dir_all(dir.parent().expect("scratch parent"));
    }
}
