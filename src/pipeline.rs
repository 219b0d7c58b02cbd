use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::alignment::AlignmentJudge;
use crate::consensus::ConsensusChecker;
use crate::model::{
    AlignmentVerdict, ConsensusVerdict, Report, ResolutionStatus, Statement, StatementKind,
    StatementRecord,
};
use crate::references::resolve_sources;
use crate::urls::UrlCache;

/// Evaluates the statements of one report: cited ones through source
/// resolution and alignment, uncited ones through the consensus panel.
pub struct StatementPipeline {
    cache: Arc<UrlCache>,
    aligner: AlignmentJudge,
    checker: ConsensusChecker,
    concurrency: usize,
}

impl StatementPipeline {
    pub fn new(
        cache: Arc<UrlCache>,
        aligner: AlignmentJudge,
        checker: ConsensusChecker,
        concurrency: usize,
    ) -> Self {
        Self {
            cache,
            aligner,
            checker,
            concurrency: concurrency.max(1),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Records come back in statement order regardless of completion order.
    pub async fn evaluate(&self, report: &Report, statements: Vec<Statement>) -> Vec<StatementRecord> {
        let records: Vec<StatementRecord> = stream::iter(statements)
            .map(|statement| self.evaluate_statement(report, statement))
            .buffered(self.concurrency)
            .collect()
            .await;

        info!(
            report_id = %report.id,
            statements = records.len(),
            "evaluated statements"
        );
        records
    }

    async fn evaluate_statement(&self, report: &Report, statement: Statement) -> StatementRecord {
        match statement.kind {
            StatementKind::Cited => {
                let sources =
                    resolve_sources(&statement.markers, &report.references, &self.cache).await;
                let alignment = self.aligner.judge(&statement, &sources).await;
                StatementRecord {
                    statement,
                    sources,
                    alignment: Some(alignment),
                    consensus: None,
                }
            }
            StatementKind::NonCited => {
                let consensus = self.checker.check(&statement).await;
                StatementRecord {
                    statement,
                    sources: Vec::new(),
                    alignment: None,
                    consensus: Some(consensus),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementSummary {
    pub report_id: String,
    pub total_statements: usize,
    pub cited: usize,
    pub non_cited: usize,
    pub sources_resolved: usize,
    pub sources_unresolved: usize,
    pub sources_fetch_failed: usize,
    pub aligned: usize,
    pub misaligned: usize,
    pub unverifiable: usize,
    pub supported: usize,
    pub unsupported: usize,
    pub indeterminate: usize,
}

pub fn summarize(report_id: &str, records: &[StatementRecord]) -> StatementSummary {
    let mut summary = StatementSummary {
        report_id: report_id.to_string(),
        total_statements: records.len(),
        ..StatementSummary::default()
    };

    for record in records {
        match record.statement.kind {
            StatementKind::Cited => summary.cited += 1,
            StatementKind::NonCited => summary.non_cited += 1,
        }
        for source in &record.sources {
            match source.status {
                ResolutionStatus::Resolved => summary.sources_resolved += 1,
                ResolutionStatus::Unresolved => summary.sources_unresolved += 1,
                ResolutionStatus::FetchFailed => summary.sources_fetch_failed += 1,
            }
        }
        if let Some(alignment) = &record.alignment {
            match alignment.verdict {
                AlignmentVerdict::Aligned => summary.aligned += 1,
                AlignmentVerdict::Misaligned => summary.misaligned += 1,
                AlignmentVerdict::Unverifiable => summary.unverifiable += 1,
            }
        }
        if let Some(consensus) = &record.consensus {
            match consensus.verdict {
                ConsensusVerdict::Supported => summary.supported += 1,
                ConsensusVerdict::Unsupported => summary.unsupported += 1,
                ConsensusVerdict::Indeterminate => summary.indeterminate += 1,
            }
        }
    }

    summary
}
