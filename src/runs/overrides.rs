//! Building the override property map applied to every submitted run.
//!
//! Precedence, lowest first: override files in the order given, then
//! `--override` flags. Portfolio per-class overrides are layered on later
//! by [`Portfolio::ready_runs`](super::portfolio::Portfolio::ready_runs).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::OverridesError;

/// Override file path meaning "read no file".
pub const NO_OVERRIDE_FILE: &str = "-";

/// Parses a Java-style properties document.
pub fn parse_properties(text: &str) -> BTreeMap<String, String> {
    let mut properties = BTreeMap::new();
    let mut pending = String::new();

    for raw in text.lines() {
        let line = raw.trim_start();
        if pending.is_empty() && (line.is_empty() || line.starts_with('#') || line.starts_with('!')) {
            continue;
        }

        if ends_with_continuation(line) {
            pending.push_str(&line[..line.len() - 1]);
            continue;
        }
        pending.push_str(line);

        let (key, value) = split_property(&pending);
        properties.insert(unescape(&key), unescape(&value));
        pending.clear();
    }

    if !pending.is_empty() {
        let (key, value) = split_property(&pending);
        properties.insert(unescape(&key), unescape(&value));
    }

    properties
}

// An odd number of trailing backslashes continues the line.
fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|c| *c == '\\').count() % 2 == 1
}

fn split_property(line: &str) -> (String, String) {
    let mut key = String::new();
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                key.push(c);
                if let Some(next) = chars.next() {
                    key.push(next);
                }
            }
            '=' | ':' => break,
            c if c.is_whitespace() => {
                while let Some(next) = chars.peek() {
                    if next.is_whitespace() {
                        chars.next();
                    } else {
                        break;
                    }
                }
                if matches!(chars.peek(), Some('=') | Some(':')) {
                    chars.next();
                }
                break;
            }
            _ => key.push(c),
        }
    }
    let value: String = chars.collect();
    (key, value.trim_start().to_string())
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Loads one override file. `-` yields an empty map.
pub fn load_override_file(path: &str) -> Result<BTreeMap<String, String>, OverridesError> {
    if path == NO_OVERRIDE_FILE {
        return Ok(BTreeMap::new());
    }
    let text = std::fs::read_to_string(path).map_err(|e| OverridesError::FileUnreadable {
        path: path.to_string(),
        reason: e.to_string(),
    })?;
    Ok(parse_properties(&text))
}

/// Splits `name=value`. Both halves must be non-empty.
pub fn parse_override(text: &str) -> Result<(String, String), OverridesError> {
    match text.split_once('=') {
        Some((key, value)) if !key.is_empty() && !value.is_empty() => {
            Ok((key.to_string(), value.to_string()))
        }
        _ => Err(OverridesError::Malformed(text.to_string())),
    }
}

/// Override files to use when none were named: `<home>/overrides.properties`
/// if it exists.
pub fn default_override_files(home: &Path) -> Vec<String> {
    let candidate: PathBuf = home.join("overrides.properties");
    if candidate.is_file() {
        vec![candidate.display().to_string()]
    } else {
        Vec::new()
    }
}

/// Expands comma separated entries into a flat list of paths.
pub fn split_file_list(paths: &[String]) -> Vec<String> {
    paths
        .iter()
        .flat_map(|p| p.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Merges the override files and command line overrides.
pub fn build_override_map(
    files: &[String],
    command_line: &[String],
) -> Result<BTreeMap<String, String>, OverridesError> {
    let mut combined = BTreeMap::new();

    for path in files {
        for (key, value) in load_override_file(path)? {
            if combined.contains_key(&key) {
                info!(
                    property = %key,
                    file = %path,
                    "Override file value replaces one from an earlier file"
                );
            }
            combined.insert(key, value);
        }
    }

    for text in command_line {
        let (key, value) = parse_override(text)?;
        if combined.contains_key(&key) {
            info!(
                property = %key,
                "Command line override replaces the value from an override file"
            );
        }
        combined.insert(key, value);
    }

    debug!(count = combined.len(), "Built override map");
    Ok(combined)
}
