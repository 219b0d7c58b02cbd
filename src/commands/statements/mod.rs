use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::{self, StreamExt};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::info;

use crate::alignment::AlignmentJudge;
use crate::cli::{FilterMode, StatementsArgs};
use crate::commands::manifest::RunRecorder;
use crate::commands::{
    STATEMENT_SUMMARY_FILE, STATEMENTS_FILE, build_url_cache, guarded_judge, report_id_hint,
    report_output_dir,
};
use crate::config::{JudgePanel, JudgeSettings, RetryPolicy, load_judge_panel, process_env};
use crate::consensus::ConsensusChecker;
use crate::extract::{HeuristicFilter, LlmStatementFilter, StatementFilter, extract};
use crate::input::{list_report_files, load_report};
use crate::model::StatementRecord;
use crate::pipeline::{StatementPipeline, StatementSummary, summarize};
use crate::util::{ensure_directory, write_json_pretty, write_jsonl};


pub async fn run(args: StatementsArgs) -> Result<()> {
    let files = list_report_files(&args.input_dir)?;
    let panel = load_judge_panel(args.judges_config.as_deref(), &process_env)?;
    ensure_directory(&args.output_dir)?;

    let deadline = args.fetch.deadline();
    let cache = build_url_cache(&args.fetch, deadline)?;
    let judge_limiter = Arc::new(Semaphore::new(args.fetch.max_in_flight.max(1)));
    let retry = args.fetch.retry_policy();
    let guard = |settings: &JudgeSettings| guarded_judge(settings, &judge_limiter, retry, deadline);

    let filter: Box<dyn StatementFilter> = match args.filter {
        FilterMode::Llm => Box::new(LlmStatementFilter::new(guard(&panel.filter)?)),
        FilterMode::Heuristic => Box::new(HeuristicFilter::default()),
    };
    let verifiers = panel
        .verifiers
        .iter()
        .map(|settings| guard(settings))
        .collect::<Result<Vec<_>>>()?;
    let checker = ConsensusChecker::new(
        verifiers,
        panel.samples_per_verifier,
        vote_timeout(&panel, retry),
    )?;
    let vote_slots = checker.vote_slots();
    let pipeline = StatementPipeline::new(
        cache.clone(),
        AlignmentJudge::new(guard(&panel.aligner)?),
        checker,
        args.concurrency,
    );

    let mut recorder = RunRecorder::start("statements", &args.input_dir, &args.output_dir, files.len())?;
    recorder.note(format!(
        "filter={} verifiers={} vote_slots={} aligner={}",
        args.filter.as_str(),
        panel.verifiers.len(),
        vote_slots,
        panel.aligner.model
    ));

    let outcomes = evaluate_report_files(
        &files,
        &pipeline,
        filter.as_ref(),
        &args.output_dir,
        args.report_concurrency,
    )
    .await;
    for (path, outcome) in outcomes {
        match outcome {
            Ok(_) => recorder.record_success(),
            Err(err) => recorder.record_failure(path, report_id_hint(path).as_deref(), &err),
        }
    }
    if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
        recorder.warn("run deadline reached; late statements degraded to unverifiable or no vote");
    }

    let stats = cache.stats();
    recorder.note(format!(
        "url_cache entries={} fetches={} store_hits={}",
        stats.entries, stats.fetches, stats.store_hits
    ));
    recorder.finish()?;
    Ok(())
}

/// Whole-panel budget for one vote: every retry of one call plus its backoff.
fn vote_timeout(panel: &JudgePanel, retry: RetryPolicy) -> Duration {
    let per_call = panel
        .verifiers
        .iter()
        .map(|settings| settings.timeout)
        .max()
        .unwrap_or_default();
    let attempts = retry.max_attempts.max(1) as u32;
    per_call * attempts + retry.max_delay * attempts
}

/// Evaluates up to `concurrency` reports at once. Outcomes come back sorted
/// by path so the manifest does not depend on completion order.
pub async fn evaluate_report_files<'a>(
    files: &'a [PathBuf],
    pipeline: &StatementPipeline,
    filter: &dyn StatementFilter,
    output_dir: &Path,
    concurrency: usize,
) -> Vec<(&'a PathBuf, Result<StatementSummary>)> {
    let mut outcomes: Vec<(&PathBuf, Result<StatementSummary>)> = stream::iter(files)
        .map(|path| async move {
            (path, evaluate_report_file(path, pipeline, filter, output_dir).await)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    outcomes.sort_by(|(left, _), (right, _)| left.cmp(right));
    outcomes
}

/// Extracts and evaluates one report file, writing its statement outputs.
pub async fn evaluate_report_file(
    path: &Path,
    pipeline: &StatementPipeline,
    filter: &dyn StatementFilter,
    output_dir: &Path,
) -> Result<StatementSummary> {
    let report = load_report(path)?;
    let statements = extract(&report, filter, pipeline.concurrency()).await;
    let records: Vec<StatementRecord> = pipeline.evaluate(&report, statements).await;
    let summary = summarize(&report.id, &records);

    let report_dir = report_output_dir(output_dir, &report.id);
    write_jsonl(&report_dir.join(STATEMENTS_FILE), &records)
        .with_context(|| format!("failed to write statements for {}", report.id))?;
    write_json_pretty(&report_dir.join(STATEMENT_SUMMARY_FILE), &summary)?;

    info!(
        report_id = %report.id,
        cited = summary.cited,
        non_cited = summary.non_cited,
        aligned = summary.aligned,
        supported = summary.supported,
        "report statements written"
    );
    Ok(summary)
}
