//! Placeholder scanner and typed renderer for manifest templates.
//!
//! Three forms are recognised in raw manifest text:
//!
//! - `$g{key}` / `$g{key:default}`: scalar, substituted in place
//! - `$a{key:[a, b]}`: array, one line per element
//! - `$d{key:{k: v}}`: map, one `k: v` line per entry
//!
//! Array and map placeholders must end their line. The text preceding them
//! on that line (indentation plus any `- ` marker) becomes the prefix of
//! every emitted line. Defaults are parsed as YAML flow values, so
//! `$g{replicas:3}` defaults to the number 3, not the string `"3"`. A scalar
//! that falls back to its default is rendered from the default's source
//! text, so `python:$g{pyver:3.10}` stays `python:3.10`.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use conductor_core::{Error, Result};

static OPENER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$([gad])\{").unwrap());

/// Shape of the value a placeholder expands to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaceholderKind {
    Scalar,
    Array,
    Map,
}

impl PlaceholderKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'g' => Some(Self::Scalar),
            b'a' => Some(Self::Array),
            b'd' => Some(Self::Map),
            _ => None,
        }
    }
}

/// A placeholder located in template text.
#[derive(Debug, Clone, PartialEq)]
pub struct Placeholder {
    pub kind: PlaceholderKind,
    pub key: String,
    pub default: Option<Value>,
    /// Default exactly as written in the template.
    pub default_src: Option<String>,
    /// Byte range replaced on render. Arrays and maps cover their whole line.
    pub span: Range<usize>,
    /// Line prefix repeated for each emitted array/map line.
    pub prefix: String,
}

/// One substitution performed by [`render`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Substitution {
    pub kind: PlaceholderKind,
    pub key: String,
    pub default: Option<Value>,
    pub value: Value,
}

/// Output of rendering a single template.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub text: String,
    pub substitutions: Vec<Substitution>,
}

/// Locate every placeholder in `text`, in order of appearance.
pub fn scan(text: &str) -> Result<Vec<Placeholder>> {
    let mut found: Vec<Placeholder> = Vec::new();
    let mut search_from = 0;

    while let Some(m) = OPENER.find_at(text, search_from) {
        let opener = m.start();
        let kind = PlaceholderKind::from_tag(text.as_bytes()[opener + 1])
            .ok_or_else(|| placeholder_error(opener, "unknown placeholder tag"))?;
        let body_start = m.end();
        let close = find_close(text, body_start)
            .ok_or_else(|| placeholder_error(opener, "unterminated placeholder"))?;

        let body = &text[body_start..close];
        let (key, default_src) = match body.find(':') {
            Some(i) => (body[..i].trim(), Some(body[i + 1..].trim())),
            None => (body.trim(), None),
        };
        if key.is_empty() || !key.chars().all(is_key_char) {
            return Err(placeholder_error(
                opener,
                format!("invalid placeholder key `{}`", key),
            ));
        }
        let default = default_src
            .map(|src| parse_default(kind, src, opener))
            .transpose()?;

        let (span, prefix) = match kind {
            PlaceholderKind::Scalar => (opener..close + 1, String::new()),
            PlaceholderKind::Array | PlaceholderKind::Map => {
                let line_start = text[..opener].rfind('\n').map(|i| i + 1).unwrap_or(0);
                let line_end = text[close + 1..]
                    .find('\n')
                    .map(|i| close + 1 + i)
                    .unwrap_or(text.len());
                if !text[close + 1..line_end].trim().is_empty() {
                    return Err(placeholder_error(
                        opener,
                        "array and map placeholders must end their line",
                    ));
                }
                (line_start..line_end, text[line_start..opener].to_string())
            }
        };

        if let Some(prev) = found.last() {
            if span.start < prev.span.end {
                return Err(placeholder_error(opener, "overlapping placeholders"));
            }
        }

        found.push(Placeholder {
            kind,
            key: key.to_string(),
            default,
            default_src: default_src.map(str::to_string),
            span,
            prefix,
        });
        search_from = close + 1;
    }

    Ok(found)
}

/// Substitute every placeholder in `text` using values from `config`.
///
/// A key is looked up verbatim first, then as a dotted path into nested
/// objects. Missing keys fall back to the embedded default; a placeholder
/// with neither is an error.
pub fn render(text: &str, config: &Value) -> Result<Rendered> {
    let placeholders = scan(text)?;
    if placeholders.is_empty() {
        return Ok(Rendered {
            text: text.to_string(),
            substitutions: Vec::new(),
        });
    }

    let mut out = String::with_capacity(text.len());
    let mut substitutions = Vec::with_capacity(placeholders.len());
    let mut cursor = 0;

    for ph in placeholders {
        let configured = lookup(config, &ph.key).cloned();
        let from_default = configured.is_none();
        let value = configured
            .or_else(|| ph.default.clone())
            .ok_or_else(|| {
                placeholder_error(
                    ph.span.start,
                    format!("no value for `{}` and no default", ph.key),
                )
            })?;

        out.push_str(&text[cursor..ph.span.start]);
        let mut end = ph.span.end;

        let lines: Vec<String> = match ph.kind {
            PlaceholderKind::Scalar => {
                match ph.default_src.as_deref() {
                    Some(src) if from_default => out.push_str(src),
                    _ => out.push_str(&scalar_text(&value)),
                }
                Vec::new()
            }
            PlaceholderKind::Array => value
                .as_array()
                .ok_or_else(|| {
                    placeholder_error(ph.span.start, format!("`{}` is not an array", ph.key))
                })?
                .iter()
                .map(|item| format!("{}{}", ph.prefix, inline_yaml(item)))
                .collect(),
            PlaceholderKind::Map => value
                .as_object()
                .ok_or_else(|| {
                    placeholder_error(ph.span.start, format!("`{}` is not a map", ph.key))
                })?
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}{}: {}",
                        ph.prefix,
                        inline_yaml(&Value::String(k.clone())),
                        inline_yaml(v)
                    )
                })
                .collect(),
        };

        if ph.kind != PlaceholderKind::Scalar {
            if lines.is_empty() {
                // drop the now-empty line entirely
                if text[end..].starts_with('\n') {
                    end += 1;
                }
            } else {
                out.push_str(&lines.join("\n"));
            }
        }

        cursor = end;
        substitutions.push(Substitution {
            kind: ph.kind,
            key: ph.key,
            default: ph.default,
            value,
        });
    }

    out.push_str(&text[cursor..]);
    Ok(Rendered {
        text: out,
        substitutions,
    })
}

/// Look up `key` verbatim, then as a dotted path.
pub fn lookup<'a>(config: &'a Value, key: &str) -> Option<&'a Value> {
    let map = config.as_object()?;
    if let Some(v) = map.get(key) {
        return Some(v);
    }
    let mut current = config;
    for part in key.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn placeholder_error(offset: usize, message: impl Into<String>) -> Error {
    Error::Placeholder {
        offset,
        message: message.into(),
    }
}

/// Find the `}` closing a placeholder body. Placeholders never span lines.
///
/// A quote opens a quoted run only where a YAML flow scalar can start, so
/// `$g{msg:"a}b"}` closes after the quote while `$g{note:it's}` needs none.
fn find_close(text: &str, from: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 1usize;
    let mut quote: Option<u8> = None;
    let mut last = b'{';
    let mut i = from;

    while i < bytes.len() {
        let b = bytes[i];
        if b == b'\n' {
            return None;
        }
        match quote {
            Some(q) => {
                if q == b'"' && b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' if matches!(last, b':' | b'[' | b'{' | b',') => quote = Some(b),
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            },
        }
        if !b.is_ascii_whitespace() {
            last = b;
        }
        i += 1;
    }
    None
}

fn parse_default(kind: PlaceholderKind, src: &str, offset: usize) -> Result<Value> {
    match kind {
        PlaceholderKind::Scalar => {
            if src.is_empty() {
                return Ok(Value::String(String::new()));
            }
            Ok(parse_flow(src).unwrap_or_else(|| Value::String(src.to_string())))
        }
        PlaceholderKind::Array => parse_flow(src)
            .filter(Value::is_array)
            .ok_or_else(|| placeholder_error(offset, format!("invalid array default `{}`", src))),
        PlaceholderKind::Map => parse_flow(src)
            .filter(Value::is_object)
            .ok_or_else(|| placeholder_error(offset, format!("invalid map default `{}`", src))),
    }
}

fn parse_flow(src: &str) -> Option<Value> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(src).ok()?;
    serde_json::to_value(yaml).ok()
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Render a value on one line so it reads back as the same YAML value.
fn inline_yaml(value: &Value) -> String {
    match value {
        Value::String(s) => {
            let reads_back = !s.is_empty()
                && serde_yaml::from_str::<serde_yaml::Value>(s)
                    .map(|v| v.as_str() == Some(s.as_str()))
                    .unwrap_or(false);
            if reads_back {
                s.clone()
            } else {
                value.to_string()
            }
        }
        other => other.to_string(),
    }
}
