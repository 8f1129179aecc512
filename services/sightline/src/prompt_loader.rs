use anyhow::{Context, Result};
use sightline_core::{Mode, PromptSet};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

fn is_prompt_key(key: &str) -> bool {
    key == "safety"
        || Mode::ALL
            .iter()
            .any(|mode| key == mode.key() || key.strip_suffix("_query") == Some(mode.key()))
}

/// Reads `<mode>.md`, `<mode>_query.md` and `safety.md` from `dir_path`.
/// Other markdown files are reported and skipped; empty files are ignored.
pub fn load_prompt_overrides(dir_path: &Path) -> Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();

    for entry in fs::read_dir(dir_path)
        .with_context(|| format!("Failed to read prompts directory: {}", dir_path.display()))?
    {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some("md") {
            continue;
        }

        let key = path
            .file_stem()
            .and_then(|s| s.to_str())
            .context("Could not get file stem for prompt file")?
            .to_ascii_lowercase();
        if !is_prompt_key(&key) {
            tracing::warn!("Ignoring unrecognised prompt file {}", path.display());
            continue;
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read prompt file: {}", path.display()))?;
        if content.trim().is_empty() {
            tracing::warn!("Ignoring empty prompt file {}", path.display());
            continue;
        }
        prompts.insert(key, content);
    }

    Ok(prompts)
}

/// Built-in prompts, with overrides from `dir` when one is configured.
pub fn prompt_set(dir: Option<&Path>) -> Result<PromptSet> {
    let prompts = PromptSet::default();
    let Some(dir) = dir else {
        return Ok(prompts);
    };
    let overrides = load_prompt_overrides(dir)?;
    tracing::info!("Loaded {} prompt overrides from {}", overrides.len(), dir.display());
    Ok(prompts.with_overrides(&overrides))
}
