//! Utility functions and helpers

use std::path::Path;

use sha2::{Digest, Sha256};

/// Generate a hash of the given content
pub fn hash_content(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

/// Get relative path from base to target
pub fn relative_path(from: &Path, to: &Path) -> Option<String> {
    pathdiff::diff_paths(to, from)
        .map(|p| p.display().to_string())
}

/// Make every absolute path inside a module identifier relative to `context`.
///
/// Identifiers may chain loader requests with `!`; each segment is handled on
/// its own so records stay portable between machines.
pub fn make_paths_relative(context: &Path, identifier: &str) -> String {
    identifier
        .split('!')
        .map(|segment| {
            let path = Path::new(segment);
            if !path.is_absolute() {
                return segment.to_string();
            }
            match relative_path(context, path) {
                Some(relative) if relative.starts_with("..") => to_slash(&relative),
                Some(relative) => format!("./{}", to_slash(&relative)),
                None => segment.to_string(),
            }
        })
        .collect::<Vec<_>>()
        .join("!")
}

fn to_slash(path: &str) -> String {
    path.replace('\\', "/")
}

/// Format bytes as human-readable size
pub fn format_size(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = KB * 1024;
    const GB: usize = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format duration as human-readable string
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs_f64();

    if secs >= 60.0 {
        let mins = (secs / 60.0).floor() as u64;
        let remaining_secs = secs - (mins as f64 * 60.0);
        format!("{}m {:.2}s", mins, remaining_secs)
    } else if secs >= 1.0 {
        format!("{:.2}s", secs)
    } else {
        format!("{:.0}ms", secs * 1000.0)
    }
}
