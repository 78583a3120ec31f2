use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::TakoError;

/// Parse dotenv-style content into a sorted map. Accepts `export KEY=VALUE`,
/// single- or double-quoted values, and `#` comment lines. Lines that do not
/// declare a valid variable are skipped.
pub fn parse_dotenv(content: &str) -> BTreeMap<String, String> {
    content.lines().filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").map(str::trim).unwrap_or(line);

    let eq = line.find('=')?;
    let key = line[..eq].trim_end();
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }

    Some((key.to_string(), unquote(line[eq + 1..].trim())))
}

fn unquote(raw: &str) -> String {
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return raw[1..raw.len() - 1].to_string();
        }
    }
    raw.to_string()
}

/// Render a map as dotenv lines, newline-terminated. Values that would not
/// survive a round-trip bare (whitespace, `#`, quotes) come out
/// double-quoted.
pub fn serialize_dotenv(map: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in map {
        let bare = !value.is_empty()
            && !value
                .chars()
                .any(|c| c.is_whitespace() || c == '#' || c == '"' || c == '\'');
        if bare || value.is_empty() {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
        } else {
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(value);
            out.push('"');
        }
        out.push('\n');
    }
    out
}

/// Load `./.env` if present.
pub fn load_dotenv(project_root: &Path) -> Result<BTreeMap<String, String>> {
    let path = project_root.join(".env");
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(parse_dotenv(&content))
}

/// Substitute `${NAME}` references in `raw` through `lookup`. An unresolved
/// reference is a config error, not an empty string.
pub fn resolve_vars(raw: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or_else(|| {
            TakoError::Config(format!(
                "unterminated ${{ reference near: {}",
                &rest[start..rest.len().min(start + 30)]
            ))
        })?;
        let name = &after[..end];
        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => {
                return Err(TakoError::Config(format!(
                    "unknown variable ${{{}}} (not in process env or .env)",
                    name
                ))
                .into())
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
