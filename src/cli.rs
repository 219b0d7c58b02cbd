use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::time::Instant;

use crate::config::RetryPolicy;
use crate::titles::DEFAULT_TITLE_THRESHOLD;

#[derive(Parser, Debug)]
#[command(
    name = "reportbench",
    version,
    about = "Citation and factual-accuracy scoring for generated survey reports"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Extract statements and judge citation alignment and uncited accuracy.
    Statements(StatementsArgs),
    /// Match each report's reference titles against ground truth.
    Citations(CitationsArgs),
    /// Compute per-report and corpus metrics from earlier outputs.
    Metrics(MetricsArgs),
    Status(StatusArgs),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum FilterMode {
    Llm,
    Heuristic,
}

impl FilterMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Heuristic => "heuristic",
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum PaperCheckMode {
    /// Ask the filter judge whether each page is a paper and for its title.
    Llm,
    /// Accept pages on known scholarly hosts and use their page titles.
    Host,
}

impl PaperCheckMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::Host => "host",
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct FetchArgs {
    /// SQLite file that keeps fetched pages across runs.
    #[arg(long)]
    pub cache_db: Option<PathBuf>,

    #[arg(long, default_value_t = 30)]
    pub fetch_timeout_secs: u64,

    /// Cap on concurrent outbound calls, per service.
    #[arg(long, default_value_t = 8)]
    pub max_in_flight: usize,

    #[arg(long, default_value_t = 3)]
    pub max_attempts: usize,

    #[arg(long, default_value_t = 1000)]
    pub retry_base_ms: u64,

    /// Abort outstanding external calls after this many seconds.
    #[arg(long)]
    pub run_timeout_secs: Option<u64>,
}

impl FetchArgs {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.run_timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs))
    }
}

#[derive(Args, Debug, Clone)]
pub struct StatementsArgs {
    #[arg(long)]
    pub input_dir: PathBuf,

    #[arg(long, default_value = "results")]
    pub output_dir: PathBuf,

    /// JSON judge panel; environment variables fill anything it omits.
    #[arg(long)]
    pub judges_config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = FilterMode::Llm)]
    pub filter: FilterMode,

    /// Statements evaluated concurrently within one report.
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Reports evaluated concurrently.
    #[arg(long, default_value_t = 2)]
    pub report_concurrency: usize,

    #[command(flatten)]
    pub fetch: FetchArgs,
}

#[derive(Args, Debug, Clone)]
pub struct CitationsArgs {
    #[arg(long)]
    pub input_dir: PathBuf,

    #[arg(long)]
    pub ground_truth_dir: PathBuf,

    #[arg(long, default_value = "results")]
    pub output_dir: PathBuf,

    #[arg(long, default_value_t = DEFAULT_TITLE_THRESHOLD)]
    pub title_threshold: f64,

    /// Leave URL-only references untitled instead of fetching their pages.
    #[arg(long, default_value_t = false)]
    pub skip_title_fetch: bool,

    /// How fetched URL-only references are accepted as papers.
    #[arg(long, value_enum, default_value_t = PaperCheckMode::Llm)]
    pub paper_check: PaperCheckMode,

    /// JSON judge panel; its `filter` judge classifies fetched pages.
    #[arg(long)]
    pub judges_config: Option<PathBuf>,

    #[command(flatten)]
    pub fetch: FetchArgs,
}

#[derive(Args, Debug, Clone)]
pub struct MetricsArgs {
    #[arg(long, default_value = "results")]
    pub output_dir: PathBuf,

    /// Pool counts across reports instead of averaging per-report rates.
    #[arg(long, default_value_t = false)]
    pub weighted: bool,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = "results")]
    pub output_dir: PathBuf,
}
