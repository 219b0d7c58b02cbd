use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::Value;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const DEFAULT_SAMPLES_PER_VERIFIER: usize = 3;

/// Exponential backoff shared by content fetches and judge calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JudgeSettings {
    pub name: String,
    pub base_url: String,
    pub model: String,
    pub api_key: String,
    pub temperature: f32,
    pub seed: Option<u64>,
    pub max_tokens: u32,
    pub timeout: Duration,
    /// Tool declarations passed through to the endpoint, such as a web search
    /// tool for verifiers that should ground their votes.
    pub tools: Option<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JudgePanel {
    pub aligner: JudgeSettings,
    pub filter: JudgeSettings,
    pub verifiers: Vec<JudgeSettings>,
    pub samples_per_verifier: usize,
}

impl JudgePanel {
    pub fn vote_slots(&self) -> usize {
        self.verifiers.len() * self.samples_per_verifier
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct JudgeOverrides {
    name: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    api_key_env: Option<String>,
    temperature: Option<f32>,
    seed: Option<u64>,
    max_tokens: Option<u32>,
    timeout_secs: Option<u64>,
    tools: Option<Vec<Value>>,
}

impl JudgeOverrides {
    fn merged_over(&self, base: &JudgeOverrides) -> JudgeOverrides {
        JudgeOverrides {
            name: self.name.clone().or_else(|| base.name.clone()),
            base_url: self.base_url.clone().or_else(|| base.base_url.clone()),
            model: self.model.clone().or_else(|| base.model.clone()),
            api_key_env: self.api_key_env.clone().or_else(|| base.api_key_env.clone()),
            temperature: self.temperature.or(base.temperature),
            seed: self.seed.or(base.seed),
            max_tokens: self.max_tokens.or(base.max_tokens),
            timeout_secs: self.timeout_secs.or(base.timeout_secs),
            tools: self.tools.clone().or_else(|| base.tools.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PanelFile {
    #[serde(default)]
    defaults: JudgeOverrides,
    #[serde(default)]
    aligner: JudgeOverrides,
    #[serde(default)]
    filter: JudgeOverrides,
    #[serde(default)]
    verifiers: Vec<JudgeOverrides>,
    samples_per_verifier: Option<usize>,
}

/// Builds the judge panel from an optional JSON file, falling back to
/// environment variables for anything the file leaves out.
pub fn load_judge_panel(
    path: Option<&Path>,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<JudgePanel> {
    let file = match path {
        Some(path) => {
            let raw = fs::read(path)
                .with_context(|| format!("failed to read judge config {}", path.display()))?;
            serde_json::from_slice::<PanelFile>(&raw)
                .with_context(|| format!("failed to parse judge config {}", path.display()))?
        }
        None => PanelFile::default(),
    };

    let env_defaults = JudgeOverrides {
        base_url: env("JUDGE_BASE_URL"),
        model: env("JUDGE_MODEL"),
        ..JudgeOverrides::default()
    };
    let defaults = file.defaults.merged_over(&env_defaults);

    let aligner = resolve_judge(&file.aligner.merged_over(&defaults), "aligner", env)?;
    let filter = resolve_judge(&file.filter.merged_over(&defaults), "filter", env)?;

    let verifier_overrides = if file.verifiers.is_empty() {
        verifiers_from_env(env)
    } else {
        file.verifiers.clone()
    };
    let verifiers = verifier_overrides
        .iter()
        .enumerate()
        .map(|(index, overrides)| {
            resolve_judge(
                &overrides.merged_over(&defaults),
                &format!("verifier-{}", index + 1),
                env,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let samples_per_verifier = match file.samples_per_verifier {
        Some(samples) => samples,
        None => match env("VERIFIER_SAMPLES") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .with_context(|| format!("VERIFIER_SAMPLES is not a positive integer: {raw}"))?,
            None => DEFAULT_SAMPLES_PER_VERIFIER,
        },
    };

    let panel = JudgePanel {
        aligner,
        filter,
        verifiers,
        samples_per_verifier,
    };
    validate_panel(&panel)?;
    Ok(panel)
}

pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn verifiers_from_env(env: &dyn Fn(&str) -> Option<String>) -> Vec<JudgeOverrides> {
    match env("VERIFIER_MODELS") {
        Some(models) => models
            .split(',')
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .map(|model| JudgeOverrides {
                name: Some(model.to_string()),
                model: Some(model.to_string()),
                ..JudgeOverrides::default()
            })
            .collect(),
        None => vec![JudgeOverrides::default()],
    }
}

fn resolve_judge(
    overrides: &JudgeOverrides,
    role: &str,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<JudgeSettings> {
    let api_key_env = overrides
        .api_key_env
        .clone()
        .unwrap_or_else(|| DEFAULT_API_KEY_ENV.to_string());
    let Some(api_key) = env(&api_key_env) else {
        bail!("missing credentials for {role}: environment variable {api_key_env} is not set");
    };
    let model = overrides
        .model
        .clone()
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());

    Ok(JudgeSettings {
        name: overrides
            .name
            .clone()
            .unwrap_or_else(|| format!("{role}:{model}")),
        base_url: overrides
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string(),
        model,
        api_key,
        temperature: overrides.temperature.unwrap_or(0.0),
        seed: overrides.seed.or(Some(42)),
        max_tokens: overrides.max_tokens.unwrap_or(1024),
        timeout: Duration::from_secs(overrides.timeout_secs.unwrap_or(120)),
        tools: overrides.tools.clone().filter(|tools| !tools.is_empty()),
    })
}

fn validate_panel(panel: &JudgePanel) -> Result<()> {
    if panel.verifiers.is_empty() {
        bail!("judge panel must configure at least one verifier");
    }
    if panel.samples_per_verifier == 0 {
        bail!("samples_per_verifier must be at least 1");
    }
    if panel.vote_slots() < 2 {
        bail!(
            "consensus needs at least 2 votes per statement, configured {} verifier(s) x {} sample(s)",
            panel.verifiers.len(),
            panel.samples_per_verifier
        );
    }

    let judges = std::iter::once(&panel.aligner)
        .chain(std::iter::once(&panel.filter))
        .chain(panel.verifiers.iter());
    for judge in judges {
        if !(0.0..=2.0).contains(&judge.temperature) {
            bail!(
                "judge {} has temperature {} outside 0.0..=2.0",
                judge.name,
                judge.temperature
            );
        }
        if judge.max_tokens == 0 {
            bail!("judge {} has max_tokens = 0", judge.name);
        }
    }

    Ok(())
}
