use std::fs;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::commands::{CORPUS_SUMMARY_FILE, RUN_MANIFEST_FILE, STATEMENTS_FILE};
use crate::metrics::CorpusSummary;
use crate::model::EvalRunManifest;

pub fn run(args: StatusArgs) -> Result<()> {
    let manifest_path = args.output_dir.join(RUN_MANIFEST_FILE);
    let summary_path = args.output_dir.join(CORPUS_SUMMARY_FILE);

    info!(output_dir = %args.output_dir.display(), "status requested");

    if manifest_path.exists() {
        let raw = fs::read(&manifest_path)
            .with_context(|| format!("failed to read {}", manifest_path.display()))?;
        let manifest: EvalRunManifest = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", manifest_path.display()))?;

        info!(
            run_id = %manifest.run_id,
            command = %manifest.command,
            status = %manifest.status,
            started_at = %manifest.started_at,
            updated_at = %manifest.updated_at,
            reports_total = manifest.reports_total,
            reports_completed = manifest.reports_completed,
            failures = manifest.failures.len(),
            warnings = manifest.warnings.len(),
            "loaded run manifest"
        );
        for failure in &manifest.failures {
            warn!(
                source_file = %failure.source_file,
                reason = %failure.reason,
                "recorded report failure"
            );
        }
    } else {
        warn!(path = %manifest_path.display(), "run manifest missing");
    }

    let evaluated = count_evaluated_reports(&args.output_dir);
    info!(reports_with_statements = evaluated, "report outputs");

    if summary_path.exists() {
        let raw = fs::read(&summary_path)
            .with_context(|| format!("failed to read {}", summary_path.display()))?;
        let summary: CorpusSummary = serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", summary_path.display()))?;
        match summary {
            CorpusSummary::Summary(corpus) => info!(
                reports = corpus.reports,
                f1 = ?corpus.f1,
                alignment_rate = ?corpus.alignment_rate,
                non_cited_accuracy = ?corpus.non_cited_accuracy,
                "loaded corpus summary"
            ),
            CorpusSummary::NoData => warn!("corpus summary has no data"),
        }
    } else {
        warn!(path = %summary_path.display(), "corpus summary missing");
    }

    Ok(())
}

fn count_evaluated_reports(output_dir: &std::path::Path) -> usize {
    fs::read_dir(output_dir)
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().join(STATEMENTS_FILE).is_file())
                .count()
        })
        .unwrap_or(0)
}
