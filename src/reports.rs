//! Generated artifacts: CSV exports and JSON render models under `media/`.

use anyhow::Context;
use chrono::Utc;
use serde_json::Value;
use std::path::{Path, PathBuf};

pub fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

/// Builds a CSV document from a header and rows of already-rendered cells.
pub fn csv_document(header: &[&str], rows: &[Vec<String>]) -> String {
    let mut csv = header.join(",");
    csv.push('\n');
    for row in rows {
        let line = row
            .iter()
            .map(|c| csv_quote(c))
            .collect::<Vec<_>>()
            .join(",");
        csv.push_str(&line);
        csv.push('\n');
    }
    csv
}

pub fn write_text(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    std::fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

/// Keeps generated file names portable.
pub fn slug(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "x".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Writes a render model to `<workspace>/media/<subdir>/<stem>_<timestamp>.json`
/// and returns the path.
pub fn write_render_model(
    workspace: &Path,
    subdir: &str,
    stem: &str,
    model: &Value,
) -> anyhow::Result<PathBuf> {
    let stamp = Utc::now().format("%Y%m%d%H%M%S%3f");
    let path = workspace
        .join("media")
        .join(subdir)
        .join(format!("{}_{}.json", stem, stamp));
    let text = serde_json::to_string_pretty(model)?;
    write_text(&path, &text)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_cells_are_quoted_when_needed() {
        let doc = csv_document(
            &["a", "b"],
            &[vec!["plain".into(), "with, comma".into()], vec!["say \"hi\"".into(), "".into()]],
        );
        assert_eq!(doc, "a,b\nplain,\"with, comma\"\n\"say \"\"hi\"\"\",\n");
    }

    #[test]
    fn slug_is_portable() {
        assert_eq!(slug("10º Ano A"), "10_ano_a");
        assert_eq!(slug("***"), "x");
    }

    #[test]
    fn render_model_lands_under_media() {
        let dir = tempfile::tempdir().unwrap();
        let p = write_render_model(
            dir.path(),
            "pedagogico/boletins",
            "boletim_t1_1",
            &serde_json::json!({"k": 1}),
        )
        .unwrap();
        assert!(p.starts_with(dir.path().join("media/pedagogico/boletins")));
        let back: Value = serde_json::from_str(&std::fs::read_to_string(p).unwrap()).unwrap();
        assert_eq!(back["k"], 1);
    }
}
