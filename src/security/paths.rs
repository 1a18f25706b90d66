//! Path canonicalization for the sandbox check.

use std::path::{Component, Path, PathBuf};

const WINDOWS_RESERVED: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Expand `~` and join relative paths onto `root`.
#[must_use]
pub fn absolutize(root: &Path, raw: &str) -> PathBuf {
    let expanded = shellexpand::tilde(raw.trim());
    let path = Path::new(expanded.as_ref());
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

/// Canonicalize a path that may not exist yet.
///
/// Components are walked left to right. While the prefix exists it is resolved
/// through the filesystem (following symlinks); a missing component is kept
/// lexically. `..` returns to a resolved directory, so the components after it
/// are checked against the filesystem again.
#[must_use]
pub fn canonicalize_lenient(path: &Path) -> PathBuf {
    let mut resolved = PathBuf::new();
    let mut on_disk = true;

    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => resolved.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
                on_disk = true;
            }
            Component::Normal(name) => {
                let candidate = resolved.join(name);
                if on_disk && std::fs::symlink_metadata(&candidate).is_ok() {
                    resolved = std::fs::canonicalize(&candidate).unwrap_or(candidate);
                } else {
                    on_disk = false;
                    resolved = candidate;
                }
            }
        }
    }
    resolved
}

/// Forward-slash rendering used for pattern matching.
#[must_use]
pub fn display_for_matching(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// First component whose stem is a Windows device name (`CON`, `nul.txt`, ...).
pub fn reserved_component(path: &Path) -> Option<String> {
    path.components().find_map(|component| {
        let Component::Normal(name) = component else {
            return None;
        };
        let name = name.to_string_lossy();
        let stem = name.split('.').next().unwrap_or_default().to_ascii_uppercase();
        WINDOWS_RESERVED
            .contains(&stem.as_str())
            .then(|| name.to_string())
    })
}
