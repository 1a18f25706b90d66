//! Utility helpers shared across the agentic CLI.

use std::path::Path;

use ignore::WalkBuilder;

// === Project Mapping Helpers ===

/// Manifests and readmes that identify a project type.
fn is_key_file(path: &Path) -> bool {
    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };

    matches!(
        file_name.to_lowercase().as_str(),
        "cargo.toml"
            | "package.json"
            | "requirements.txt"
            | "pyproject.toml"
            | "go.mod"
            | "pom.xml"
            | "readme.md"
            | "makefile"
            | "dockerfile"
    )
}

/// One-line description of the workspace, used in the system prompt.
#[must_use]
pub fn summarize_project(root: &Path) -> String {
    let mut key_files = Vec::new();

    let mut builder = WalkBuilder::new(root);
    builder.hidden(true).follow_links(false).max_depth(Some(2));

    for entry in builder.build().flatten() {
        if is_key_file(entry.path())
            && let Ok(rel) = entry.path().strip_prefix(root)
        {
            key_files.push(rel.to_string_lossy().to_string());
        }
    }

    if key_files.is_empty() {
        return "Unknown project type".to_string();
    }
    key_files.sort();

    let has = |needle: &str| key_files.iter().any(|f| f.to_lowercase().ends_with(needle));
    let mut types = Vec::new();
    if has("cargo.toml") {
        types.push("Rust");
    }
    if has("package.json") {
        types.push("JavaScript/Node.js");
    }
    if has("requirements.txt") || has("pyproject.toml") {
        types.push("Python");
    }
    if has("go.mod") {
        types.push("Go");
    }

    if types.is_empty() {
        format!("Project with key files: {}", key_files.join(", "))
    } else {
        format!("A {} project", types.join(" and "))
    }
}

// === Text Helpers ===

/// Largest byte index `<= max_bytes` that falls on a char boundary.
#[must_use]
pub fn char_boundary_at_or_before(text: &str, max_bytes: usize) -> usize {
    if max_bytes >= text.len() {
        return text.len();
    }
    let mut idx = max_bytes;
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Cap `output` at `max_bytes`, appending a note with the omitted size.
#[must_use]
pub fn truncate_output(output: &str, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output.to_string();
    }
    let cut = char_boundary_at_or_before(output, max_bytes);
    let omitted = output.len() - cut;
    format!(
        "{}...\n\n[Output truncated at {max_bytes} bytes. {omitted} bytes omitted.]",
        &output[..cut]
    )
}

/// Truncate a string to a maximum length, adding an ellipsis if truncated
#[must_use]
pub fn truncate_with_ellipsis(s: &str, max_len: usize, ellipsis: &str) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        let cut = char_boundary_at_or_before(s, max_len.saturating_sub(ellipsis.len()));
        format!("{}{}", &s[..cut], ellipsis)
    }
}

/// First line of `text`, shortened for one-line displays.
#[must_use]
pub fn one_line(text: &str, max_len: usize) -> String {
    let first = text.lines().next().unwrap_or_default().trim();
    let shortened = truncate_with_ellipsis(first, max_len, "...");
    if text.trim().lines().nth(1).is_some() && !shortened.ends_with("...") {
        format!("{shortened} ...")
    } else {
        shortened
    }
}
