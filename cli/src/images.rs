//! Image list collection from files and Kubernetes manifests.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use regmirror_core::error::{MirrorError, Result};

/// Read image references from a plain text file: one per line, blank lines
/// and `#` comments skipped.
pub fn read_image_list(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        MirrorError::Config(format!("cannot read image list {}: {}", path.display(), e))
    })?;

    let images: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect();

    if images.is_empty() {
        return Err(MirrorError::Config(format!(
            "image list {} contains no images",
            path.display()
        )));
    }
    Ok(images)
}

/// Collect every `image:` value from a yaml file, or from all `.yaml`/`.yml`
/// files under a directory. Duplicates are dropped, first occurrence wins.
pub fn collect_yaml_images(path: &Path) -> Result<Vec<String>> {
    let mut images = Vec::new();
    let mut seen = HashSet::new();
    visit_path(path, &mut images, &mut seen)?;

    if images.is_empty() {
        return Err(MirrorError::Config(format!(
            "no image references found under {}",
            path.display()
        )));
    }
    Ok(images)
}

fn visit_path(path: &Path, images: &mut Vec<String>, seen: &mut HashSet<String>) -> Result<()> {
    if path.is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(path)
            .map_err(|e| {
                MirrorError::Config(format!("cannot read directory {}: {}", path.display(), e))
            })?
            .collect::<std::io::Result<_>>()?;
        entries.sort_by_key(|entry| entry.file_name());
        for entry in entries {
            let child = entry.path();
            if child.is_dir() || is_yaml(&child) {
                visit_path(&child, images, seen)?;
            }
        }
        return Ok(());
    }

    let content = std::fs::read_to_string(path).map_err(|e| {
        MirrorError::Config(format!("cannot read {}: {}", path.display(), e))
    })?;
    for document in serde_yaml::Deserializer::from_str(&content) {
        // skip unparseable documents instead of failing the scan
        match serde_yaml::Value::deserialize(document) {
            Ok(value) => collect_from_value(&value, images, seen),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "Skipping unparseable yaml document");
            }
        }
    }
    Ok(())
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Walk a yaml value collecting string values of `image` keys at any depth.
fn collect_from_value(
    value: &serde_yaml::Value,
    images: &mut Vec<String>,
    seen: &mut HashSet<String>,
) {
    match value {
        serde_yaml::Value::Mapping(mapping) => {
            for (key, entry) in mapping {
                if key.as_str() == Some("image") {
                    if let Some(image) = entry.as_str() {
                        if seen.insert(image.to_string()) {
                            images.push(image.to_string());
                        }
                        continue;
                    }
                }
                collect_from_value(entry, images, seen);
            }
        }
        serde_yaml::Value::Sequence(sequence) => {
            for entry in sequence {
                collect_from_value(entry, images, seen);
            }
        }
        _ => {}
    }
}
