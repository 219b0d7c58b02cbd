use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceEntry {
    pub marker: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Report {
    pub id: String,
    pub source_file: String,
    pub text: String,
    pub references: Vec<ReferenceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CitationMarker {
    Numbered { label: String },
    InlineUrl { url: String },
}

impl CitationMarker {
    pub fn numbered(label: impl Into<String>) -> Self {
        Self::Numbered {
            label: label.into(),
        }
    }

    pub fn display_label(&self) -> &str {
        match self {
            Self::Numbered { label } => label,
            Self::InlineUrl { url } => url,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatementKind {
    Cited,
    NonCited,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub id: String,
    pub position: usize,
    pub text: String,
    pub kind: StatementKind,
    #[serde(default)]
    pub markers: Vec<CitationMarker>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthReference {
    pub title: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub bib_id: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Resolved,
    Unresolved,
    FetchFailed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub marker: CitationMarker,
    pub title: Option<String>,
    pub url: Option<String>,
    pub normalized_url: Option<String>,
    pub url_id: Option<String>,
    pub status: ResolutionStatus,
    #[serde(skip)]
    pub text: String,
    pub text_chars: usize,
    pub text_sha256: Option<String>,
    pub error: Option<String>,
}

impl ResolvedSource {
    pub fn has_text(&self) -> bool {
        self.status == ResolutionStatus::Resolved && !self.text.trim().is_empty()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentVerdict {
    Aligned,
    Misaligned,
    Unverifiable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentOutcome {
    pub verdict: AlignmentVerdict,
    pub evidence: Option<String>,
    pub reason: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusVerdict {
    Supported,
    Unsupported,
    Indeterminate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeVote {
    pub judge: String,
    pub sample: usize,
    pub decision: Option<bool>,
    pub confidence: Option<f64>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusOutcome {
    pub verdict: ConsensusVerdict,
    pub support_votes: usize,
    pub refute_votes: usize,
    pub abstentions: usize,
    pub votes: Vec<JudgeVote>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementRecord {
    #[serde(flatten)]
    pub statement: Statement,
    #[serde(default)]
    pub sources: Vec<ResolvedSource>,
    #[serde(default)]
    pub alignment: Option<AlignmentOutcome>,
    #[serde(default)]
    pub consensus: Option<ConsensusOutcome>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportFailure {
    pub source_file: String,
    pub report_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub command: String,
    pub status: String,
    pub started_at: String,
    pub updated_at: String,
    pub input_dir: String,
    pub output_dir: String,
    pub reports_total: usize,
    pub reports_completed: usize,
    pub failures: Vec<ReportFailure>,
    pub warnings: Vec<String>,
    pub notes: Vec<String>,
}
