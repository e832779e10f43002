//! Shared path construction for mount points.

use std::path::{Component, Path, PathBuf};

/// Replacement for characters that may not appear in a mount directory name.
const REPLACEMENT: char = '_';

/// Turn an untrusted value (device serial, user name) into exactly one safe
/// path component.
///
/// Only ASCII alphanumerics, `-`, `_` and `.` survive; everything else
/// becomes `_`. Values that would still be special (`""`, `.`, `..`) are
/// replaced wholesale.
#[must_use]
pub fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                REPLACEMENT
            }
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        return REPLACEMENT.to_string();
    }
    cleaned
}

/// Mount point for a device: `<media_root>/<user>/<serial>`.
#[must_use]
pub fn mount_point(media_root: &Path, user: &str, serial: &str) -> PathBuf {
    media_root
        .join(sanitize_component(user))
        .join(sanitize_component(serial))
}

/// Whether `path`, after syntactic normalization, still lies under `root`.
#[must_use]
pub fn is_contained(root: &Path, path: &Path) -> bool {
    normalize_syntactic(path).starts_with(normalize_syntactic(root))
}

fn normalize_syntactic(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::Normal(_) => {
                components.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
        }
    }
    components.into_iter().collect()
}
