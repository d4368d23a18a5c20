//! Template resolution over a directory of manifest files.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use conductor_core::{Error, Result};

use crate::placeholder::{self, PlaceholderKind};

const TEMPLATE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Rendered templates plus the value that took effect for every key.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Rendered text keyed by path relative to the template root.
    pub files: BTreeMap<String, String>,
    /// Effective value per key. When files disagree on a key's default, the
    /// first file in path order wins here; each file still renders with its
    /// own default.
    pub values: BTreeMap<String, Value>,
}

/// Default and effective value of one placeholder key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaceholderInfo {
    pub kind: PlaceholderKind,
    pub default: Option<Value>,
    pub value: Value,
}

/// Dry-run rendering with per-key introspection. As with
/// [`Resolution::values`], the first file in path order that mentions a key
/// supplies its entry.
#[derive(Debug, Clone, Default)]
pub struct ManifestView {
    pub files: BTreeMap<String, String>,
    pub placeholders: BTreeMap<String, PlaceholderInfo>,
}

/// Render every template under `path` against `overrides`.
pub fn resolve(path: &Path, overrides: &Value) -> Result<Resolution> {
    let mut resolution = Resolution::default();
    for (name, text) in read_templates(path)? {
        let rendered = render_file(&name, &text, overrides)?;
        for sub in rendered.substitutions {
            resolution.values.entry(sub.key).or_insert(sub.value);
        }
        resolution.files.insert(name, rendered.text);
    }
    debug!(
        "Resolved {} templates ({} keys) under {}",
        resolution.files.len(),
        resolution.values.len(),
        path.display()
    );
    Ok(resolution)
}

/// Same rendering as [`resolve`], reporting defaults alongside effective values.
pub fn view(path: &Path, overrides: &Value) -> Result<ManifestView> {
    let mut view = ManifestView::default();
    for (name, text) in read_templates(path)? {
        let rendered = render_file(&name, &text, overrides)?;
        for sub in rendered.substitutions {
            view.placeholders
                .entry(sub.key)
                .or_insert(PlaceholderInfo {
                    kind: sub.kind,
                    default: sub.default,
                    value: sub.value,
                });
        }
        view.files.insert(name, rendered.text);
    }
    Ok(view)
}

/// Render a single template string.
pub fn resolve_text(text: &str, overrides: &Value) -> Result<String> {
    Ok(placeholder::render(text, overrides)?.text)
}

fn render_file(name: &str, text: &str, overrides: &Value) -> Result<placeholder::Rendered> {
    placeholder::render(text, overrides).map_err(|e| match e {
        Error::Placeholder { offset, message } => Error::Manifest(format!(
            "{} (byte {}): {}",
            name, offset, message
        )),
        other => other,
    })
}

/// Read template files under `path` (or `path` itself if it is a file).
fn read_templates(path: &Path) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    if path.is_file() {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        out.insert(name, std::fs::read_to_string(path)?);
        return Ok(out);
    }
    if !path.is_dir() {
        return Err(Error::NotFound(format!(
            "manifest templates at {}",
            path.display()
        )));
    }
    collect_templates(path, path, &mut out)?;
    Ok(out)
}

fn collect_templates(root: &Path, dir: &Path, out: &mut BTreeMap<String, String>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();
        if name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            collect_templates(root, &path, out)?;
            continue;
        }
        let is_template = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| TEMPLATE_EXTENSIONS.contains(&e))
            .unwrap_or(false);
        if !is_template {
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .map_err(|e| Error::Internal(e.to_string()))?
            .to_string_lossy()
            .replace('\\', "/");
        out.insert(rel, std::fs::read_to_string(&path)?);
    }
    Ok(())
}
