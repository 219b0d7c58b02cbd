use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::commands::RUN_MANIFEST_FILE;
use crate::model::{EvalRunManifest, ReportFailure};
use crate::util::{now_utc_string, utc_compact_string, write_json_pretty};

const MANIFEST_VERSION: u32 = 1;

/// Tracks one command invocation in `<output_dir>/run_manifest.json`.
pub struct RunRecorder {
    path: PathBuf,
    manifest: EvalRunManifest,
}

impl RunRecorder {
    pub fn start(
        command: &str,
        input_dir: &Path,
        output_dir: &Path,
        reports_total: usize,
    ) -> Result<Self> {
        let started_at = now_utc_string();
        let manifest = EvalRunManifest {
            manifest_version: MANIFEST_VERSION,
            run_id: format!("{command}-{}", utc_compact_string(Utc::now())),
            command: command.to_string(),
            status: "running".to_string(),
            started_at: started_at.clone(),
            updated_at: started_at,
            input_dir: input_dir.display().to_string(),
            output_dir: output_dir.display().to_string(),
            reports_total,
            reports_completed: 0,
            failures: Vec::new(),
            warnings: Vec::new(),
            notes: Vec::new(),
        };

        let recorder = Self {
            path: output_dir.join(RUN_MANIFEST_FILE),
            manifest,
        };
        recorder.persist()?;
        info!(
            run_id = %recorder.manifest.run_id,
            command,
            reports = reports_total,
            "run started"
        );
        Ok(recorder)
    }

    pub fn record_success(&mut self) {
        self.manifest.reports_completed += 1;
    }

    /// Per-report failures are data, not errors: log the chain and move on.
    pub fn record_failure(&mut self, source_file: &Path, report_id: Option<&str>, err: &anyhow::Error) {
        warn!(
            source_file = %source_file.display(),
            report_id = report_id.unwrap_or_default(),
            error = %format!("{err:#}"),
            "report failed"
        );
        self.manifest.failures.push(ReportFailure {
            source_file: source_file.display().to_string(),
            report_id: report_id.map(ToOwned::to_owned),
            reason: format!("{err:#}"),
        });
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(message = %message, "run warning");
        self.manifest.warnings.push(message);
    }

    pub fn note(&mut self, message: impl Into<String>) {
        self.manifest.notes.push(message.into());
    }

    pub fn finish(mut self) -> Result<EvalRunManifest> {
        self.manifest.status = if self.manifest.failures.is_empty() {
            "completed".to_string()
        } else {
            "completed_with_failures".to_string()
        };
        self.persist()?;

        info!(
            run_id = %self.manifest.run_id,
            status = %self.manifest.status,
            completed = self.manifest.reports_completed,
            failed = self.manifest.failures.len(),
            manifest = %self.path.display(),
            "run finished"
        );
        Ok(self.manifest)
    }

    fn persist(&self) -> Result<()> {
        let mut snapshot = self.manifest.clone();
        snapshot.updated_at = now_utc_string();
        write_json_pretty(&self.path, &snapshot)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn failures_mark_run_and_persist_reasons() {
        let dir = std::env::temp_dir().join(format!("reportbench_manifest_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);

        let mut recorder = RunRecorder::start("statements", Path::new("in"), &dir, 2)
            .expect("recorder should start");
        recorder.record_success();
        recorder.record_failure(
            Path::new("in/bad.json"),
            None,
            &anyhow::anyhow!("inner cause").context("failed to parse in/bad.json"),
        );
        let manifest = recorder.finish().expect("recorder should finish");

        assert_eq!(manifest.status, "completed_with_failures");
        assert_eq!(manifest.reports_completed, 1);
        assert!(manifest.failures[0].reason.contains("inner cause"));

        let raw = fs::read(dir.join(RUN_MANIFEST_FILE)).expect("manifest should exist");
        let stored: EvalRunManifest = serde_json::from_slice(&raw).expect("manifest should parse");
        assert_eq!(stored.run_id, manifest.run_id);

        let _ = fs::remove_dir_all(&dir);
    }
}
