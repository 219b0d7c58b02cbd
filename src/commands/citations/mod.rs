use std::path::Path;
use std::sync::Arc;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::info;

use crate::cli::{CitationsArgs, PaperCheckMode};
use crate::commands::manifest::RunRecorder;
use crate::commands::{
    CITATIONS_FILE, build_url_cache, guarded_judge, report_id_hint, report_output_dir,
};
use crate::config::{load_judge_panel, process_env};
use crate::input::{list_report_files, load_ground_truth, load_report};
use crate::model::ReferenceEntry;
use crate::papers::{PaperCheck, PaperClassifier, check_url_references};
use crate::titles::{TitleMatchResult, match_titles};
use crate::urls::UrlCache;
use crate::util::{ensure_directory, write_json_pretty};


/// Per-report contents of `citations.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CitationReport {
    pub report_id: String,
    pub references: Vec<ReferenceEntry>,
    #[serde(default)]
    pub paper_checks: Vec<PaperCheck>,
    pub result: TitleMatchResult,
}

/// Fetching and paper classification for URL-only references.
pub struct TitleLookup<'a> {
    pub cache: &'a UrlCache,
    pub classifier: &'a PaperClassifier,
}

pub async fn run(args: CitationsArgs) -> Result<()> {
    if !args.ground_truth_dir.is_dir() {
        bail!(
            "ground truth directory does not exist: {}",
            args.ground_truth_dir.display()
        );
    }
    let files = list_report_files(&args.input_dir)?;
    ensure_directory(&args.output_dir)?;

    let deadline = args.fetch.deadline();
    let lookup_parts = if args.skip_title_fetch {
        None
    } else {
        let cache = build_url_cache(&args.fetch, deadline)?;
        let classifier = match args.paper_check {
            PaperCheckMode::Host => PaperClassifier::by_host(),
            PaperCheckMode::Llm => {
                let panel = load_judge_panel(args.judges_config.as_deref(), &process_env)?;
                let limiter = Arc::new(Semaphore::new(args.fetch.max_in_flight.max(1)));
                PaperClassifier::new(guarded_judge(
                    &panel.filter,
                    &limiter,
                    args.fetch.retry_policy(),
                    deadline,
                )?)
            }
        };
        Some((cache, classifier))
    };
    let lookup = lookup_parts.as_ref().map(|(cache, classifier)| TitleLookup {
        cache: cache.as_ref(),
        classifier,
    });

    let mut recorder = RunRecorder::start("citations", &args.input_dir, &args.output_dir, files.len())?;
    recorder.note(format!(
        "title_threshold={} ground_truth_dir={} paper_check={}",
        args.title_threshold,
        args.ground_truth_dir.display(),
        if args.skip_title_fetch {
            "skipped"
        } else {
            args.paper_check.as_str()
        }
    ));

    for path in &files {
        match match_report_file(
            path,
            &args.ground_truth_dir,
            lookup.as_ref(),
            args.title_threshold,
            &args.output_dir,
        )
        .await
        {
            Ok(_) => recorder.record_success(),
            Err(err) => recorder.record_failure(path, report_id_hint(path).as_deref(), &err),
        }
    }

    recorder.finish()?;
    Ok(())
}

/// Matches one report's reference titles (URL-only references count only when
/// judged to be papers) and writes `<out>/<id>/citations.json`.
pub async fn match_report_file(
    path: &Path,
    ground_truth_dir: &Path,
    lookup: Option<&TitleLookup<'_>>,
    threshold: f64,
    output_dir: &Path,
) -> Result<CitationReport> {
    let report = load_report(path)?;
    let Some(truth) = load_ground_truth(ground_truth_dir, &report.id)? else {
        bail!("no ground truth for report {}", report.id);
    };

    let (references, paper_checks) = match lookup {
        Some(lookup) => {
            check_url_references(&report.references, lookup.cache, lookup.classifier).await
        }
        None => (report.references.clone(), Vec::new()),
    };
    let report_titles: Vec<String> = references
        .iter()
        .filter_map(|entry| entry.title.clone())
        .filter(|title| !title.trim().is_empty())
        .collect();
    let truth_titles: Vec<String> = truth.into_iter().map(|row| row.title).collect();

    let result = match_titles(&report_titles, &truth_titles, threshold);
    info!(
        report_id = %report.id,
        references = references.len(),
        titled = report_titles.len(),
        non_papers = paper_checks.iter().filter(|check| !check.is_paper).count(),
        ground_truth = truth_titles.len(),
        true_positives = result.true_positives,
        "citation titles matched"
    );

    let citation_report = CitationReport {
        report_id: report.id.clone(),
        references,
        paper_checks,
        result,
    };
    write_json_pretty(
        &report_output_dir(output_dir, &report.id).join(CITATIONS_FILE),
        &citation_report,
    )?;
    Ok(citation_report)
}
