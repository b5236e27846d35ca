use anyhow::{Result, Context as AnyhowContext};
use std::fs;
use std::path::Path;

pub fn load_definition(file_path: &Path) -> Result<String> {
    fs::read_to_string(file_path)
        .with_context(|| format!("Failed to read process definition from {}", file_path.display()))
}

/// Reads every `.bpmn` / `.xml` file in `dir`, sorted by file name.
pub fn load_definitions_from_dir(dir: &Path) -> Result<Vec<(String, String)>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("Failed to list process definitions in {}", dir.display()))?;

    let mut paths = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
            if ext == "bpmn" || ext == "xml" {
                paths.push(path);
            }
        }
    }
    paths.sort();

    let mut definitions = Vec::with_capacity(paths.len());
    for path in paths {
        let xml = load_definition(&path)?;
        definitions.push((path.display().to_string(), xml));
    }
    Ok(definitions)
}
