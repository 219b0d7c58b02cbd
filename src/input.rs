use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::model::{GroundTruthReference, ReferenceEntry, Report};
use crate::references::{parse_reference_list, split_reference_line};

const TEXT_FIELDS: &[&str] = &["response", "content", "text", "message", "output", "result"];
const MIN_TEXT_CHARS: usize = 50;

static ARXIV_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4}\.\d{5})").expect("arxiv id regex is valid"));

static ARXIV_ID_LOOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4}\.\d+)").expect("loose arxiv id regex is valid"));

/// `*.json` report files directly under `dir`, sorted by name.
pub fn list_report_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        bail!("input directory does not exist: {}", dir.display());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(dir)
        .with_context(|| format!("failed to list input directory {}", dir.display()))?
    {
        let path = entry
            .with_context(|| format!("failed to read entry in {}", dir.display()))?
            .path();
        let is_hidden = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with('.'));
        if path.is_file() && !is_hidden && path.extension().is_some_and(|ext| ext == "json") {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}

pub fn arxiv_id_from(name: &str) -> Option<String> {
    ARXIV_ID_RE
        .captures(name)
        .or_else(|| ARXIV_ID_LOOSE_RE.captures(name))
        .map(|captures| captures[1].to_string())
}

pub fn load_report(path: &Path) -> Result<Report> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let value: Value = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    let Value::Object(fields) = &value else {
        bail!("report {} is not a json object", path.display());
    };

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let id = arxiv_id_from(file_name)
        .or_else(|| {
            ["arxiv_id", "id"]
                .iter()
                .find_map(|key| scalar_string(fields.get(*key)?))
        })
        .or_else(|| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .map(ToOwned::to_owned)
        })
        .with_context(|| format!("cannot derive a report id for {}", path.display()))?;

    let Some(text) = report_text(&value) else {
        bail!("report {} has no text field", path.display());
    };

    let mut references = fields
        .get("references")
        .map(reference_entries)
        .unwrap_or_default();
    if references.is_empty() {
        references = parse_reference_list(&text);
    }

    debug!(
        report_id = %id,
        chars = text.chars().count(),
        references = references.len(),
        "loaded report"
    );

    Ok(Report {
        id,
        source_file: path.display().to_string(),
        text,
        references,
    })
}

/// First well-known text field longer than a short blurb, else the longest
/// string field.
pub fn report_text(value: &Value) -> Option<String> {
    let fields = value.as_object()?;

    for key in TEXT_FIELDS {
        if let Some(Value::String(text)) = fields.get(*key)
            && text.chars().count() > MIN_TEXT_CHARS
        {
            return Some(text.clone());
        }
    }

    fields
        .values()
        .filter_map(Value::as_str)
        .max_by_key(|text| text.chars().count())
        .filter(|text| !text.trim().is_empty())
        .map(ToOwned::to_owned)
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn reference_entries(value: &Value) -> Vec<ReferenceEntry> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };

    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| match item {
            Value::Object(fields) => {
                let marker = ["marker", "id", "index"]
                    .iter()
                    .find_map(|key| scalar_string(fields.get(*key)?))
                    .map(|marker| marker.trim_matches(['[', ']', '^']).to_string())
                    .unwrap_or_else(|| (index + 1).to_string());
                let title = fields.get("title").and_then(|title| scalar_string(title));
                let url = ["url", "link"]
                    .iter()
                    .find_map(|key| scalar_string(fields.get(*key)?));
                Some(ReferenceEntry { marker, title, url })
            }
            Value::String(line) => {
                let (title, url) = split_reference_line(line);
                Some(ReferenceEntry {
                    marker: (index + 1).to_string(),
                    title,
                    url,
                })
            }
            _ => None,
        })
        .collect()
}

#[derive(Deserialize)]
struct GroundTruthRow {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    doi: Option<String>,
    #[serde(default)]
    bib_id: Option<String>,
}

impl GroundTruthRow {
    fn into_reference(self) -> Option<GroundTruthReference> {
        let title = self.title?.trim().to_string();
        if title.is_empty() {
            return None;
        }
        Some(GroundTruthReference {
            title,
            url: self.url,
            doi: self.doi,
            bib_id: self.bib_id,
        })
    }
}

/// `<dir>/<id>.jsonl` (one row per line) or `<dir>/<id>.json` (array). A
/// missing file gives `None`.
pub fn load_ground_truth(dir: &Path, report_id: &str) -> Result<Option<Vec<GroundTruthReference>>> {
    let jsonl_path = dir.join(format!("{report_id}.jsonl"));
    let json_path = dir.join(format!("{report_id}.json"));

    let rows: Vec<GroundTruthRow> = if jsonl_path.is_file() {
        let raw = fs::read_to_string(&jsonl_path)
            .with_context(|| format!("failed to read {}", jsonl_path.display()))?;
        raw.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(line_number, line)| {
                serde_json::from_str(line).with_context(|| {
                    format!("failed to parse {} line {}", jsonl_path.display(), line_number + 1)
                })
            })
            .collect::<Result<Vec<_>>>()?
    } else if json_path.is_file() {
        let raw = fs::read(&json_path)
            .with_context(|| format!("failed to read {}", json_path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("failed to parse {}", json_path.display()))?
    } else {
        return Ok(None);
    };

    let total = rows.len();
    let references: Vec<GroundTruthReference> = rows
        .into_iter()
        .filter_map(GroundTruthRow::into_reference)
        .collect();
    if references.len() < total {
        warn!(
            report_id,
            skipped = total - references.len(),
            "ground truth rows without a title were skipped"
        );
    }

    Ok(Some(references))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "reportbench_input_{}_{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("scratch dir should be created");
        dir
    }

    #[test]
    fn arxiv_id_prefers_five_digit_suffix() {
        assert_eq!(
            arxiv_id_from("parsed_user+openai+2108.09091.json").as_deref(),
            Some("2108.09091")
        );
        assert_eq!(arxiv_id_from("old_1501.0123.json").as_deref(), Some("1501.0123"));
        assert_eq!(arxiv_id_from("report.json"), None);
    }

    #[test]
    fn text_prefers_known_fields_over_longest() {
        let long_content = "c".repeat(60);
        let longer_other = "o".repeat(200);
        let value = serde_json::json!({
            "response": "too short",
            "content": long_content,
            "debug": longer_other,
        });
        assert_eq!(report_text(&value).as_deref(), Some(long_content.as_str()));

        let fallback = serde_json::json!({"response": "short", "blob": "x".repeat(30)});
        assert_eq!(report_text(&fallback).map(|text| text.len()), Some(30));
    }

    #[test]
    fn load_report_reads_ids_and_references() {
        let dir = scratch_dir("report");
        let path = dir.join("run+gpt+2401.12345.json");
        let text = format!(
            "{} Transformers dominate [1].\n\n## References\n[1] Attention Is All You Need https://arxiv.org/abs/1706.03762\n",
            "Intro. ".repeat(10)
        );
        fs::write(&path, serde_json::json!({"response": text}).to_string())
            .expect("report should be written");

        let report = load_report(&path).expect("report should load");
        assert_eq!(report.id, "2401.12345");
        assert_eq!(report.references.len(), 1);
        assert_eq!(
            report.references[0].title.as_deref(),
            Some("Attention Is All You Need")
        );

        let explicit = dir.join("other.json");
        fs::write(
            &explicit,
            serde_json::json!({
                "id": "custom-id",
                "text": "x".repeat(80),
                "references": [{"marker": "[2]", "title": "A Title", "url": "https://a.org"}],
            })
            .to_string(),
        )
        .expect("report should be written");
        let report = load_report(&explicit).expect("report should load");
        assert_eq!(report.id, "custom-id");
        assert_eq!(report.references[0].marker, "2");

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn ground_truth_loads_jsonl_and_json_and_skips_missing() {
        let dir = scratch_dir("truth");
        fs::write(
            dir.join("2401.00001.jsonl"),
            "{\"bib_id\": \"b1\", \"title\": \"Paper One\", \"author\": \"A\"}\n\n{\"title\": \"\"}\n{\"title\": \"Paper Two\"}\n",
        )
        .expect("jsonl should be written");
        fs::write(
            dir.join("2401.00002.json"),
            "[{\"title\": \"Only Paper\", \"doi\": \"10.1/x\"}]",
        )
        .expect("json should be written");

        let first = load_ground_truth(&dir, "2401.00001")
            .expect("jsonl should load")
            .expect("jsonl should exist");
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].bib_id.as_deref(), Some("b1"));

        let second = load_ground_truth(&dir, "2401.00002")
            .expect("json should load")
            .expect("json should exist");
        assert_eq!(second[0].doi.as_deref(), Some("10.1/x"));

        assert!(
            load_ground_truth(&dir, "2401.99999")
                .expect("missing file is not an error")
                .is_none()
        );

        let _ = fs::remove_dir_all(&dir);
    }
}
