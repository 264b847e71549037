use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};

/// Environment files larger than this are refused outright.
pub const MAX_ENV_FILE_BYTES: u64 = 12 * 1024;

/// One environment edit requested by the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvAction {
    Set { name: String, value: String },
    /// A bare `NAME` line (no `=`) removes the variable.
    Unset { name: String },
}

/// Parse the restart environment file.
///
/// Grammar: `#` starts a comment that runs to end of line; blank lines are
/// ignored; `NAME=VALUE` sets, bare `NAME` unsets; inside `"…"` whitespace
/// and `#` are literal; `\x` passes `x` through; `$NAME` expands from
/// `lookup`, except that a name assigned earlier in the same file expands to
/// that value (and to empty after an earlier unset).
pub fn parse_env_file(content: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Vec<EnvAction> {
    let mut actions = Vec::new();
    let mut changed: HashMap<String, Option<String>> = HashMap::new();

    let mut name = String::new();
    let mut value = String::new();
    let mut has_value = false;
    let mut in_string = false;

    let mut flush = |name: &mut String,
                     value: &mut String,
                     has_value: &mut bool,
                     in_string: &mut bool,
                     changed: &mut HashMap<String, Option<String>>,
                     actions: &mut Vec<EnvAction>| {
        if !name.is_empty() {
            if *has_value {
                changed.insert(name.clone(), Some(value.clone()));
                actions.push(EnvAction::Set {
                    name: std::mem::take(name),
                    value: std::mem::take(value),
                });
            } else {
                changed.insert(name.clone(), None);
                actions.push(EnvAction::Unset {
                    name: std::mem::take(name),
                });
            }
        }
        name.clear();
        value.clear();
        *has_value = false;
        *in_string = false;
    };

    let mut chars = content.chars().peekable();
    while let Some(c) = chars.next() {
        let dest = if has_value { &mut value } else { &mut name };
        match c {
            '\n' => {
                if in_string {
                    dest.push(c);
                } else {
                    flush(
                        &mut name,
                        &mut value,
                        &mut has_value,
                        &mut in_string,
                        &mut changed,
                        &mut actions,
                    );
                }
            }
            ' ' | '\t' | '#' => {
                if in_string {
                    dest.push(c);
                } else {
                    // Whitespace ends the value; the rest of the line is
                    // comment either way.
                    while let Some(&next) = chars.peek() {
                        if next == '\n' {
                            break;
                        }
                        chars.next();
                    }
                }
            }
            '=' if !in_string && !has_value => {
                has_value = true;
            }
            '\\' => {
                if let Some(escaped) = chars.next() {
                    dest.push(escaped);
                }
            }
            '"' => {
                in_string = !in_string;
            }
            '$' => {
                let mut var = String::new();
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        var.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let expansion = match changed.get(&var) {
                    Some(Some(earlier)) => earlier.clone(),
                    Some(None) => String::new(),
                    None => lookup(&var).unwrap_or_default(),
                };
                dest.push_str(&expansion);
            }
            other => dest.push(other),
        }
    }
    flush(
        &mut name,
        &mut value,
        &mut has_value,
        &mut in_string,
        &mut changed,
        &mut actions,
    );

    actions
}

/// Read the env file, enforcing the size cap.
pub fn load_env_file(path: &Path) -> Result<String> {
    let meta = std::fs::metadata(path)
        .with_context(|| format!("stat env file {}", path.display()))?;
    if meta.len() > MAX_ENV_FILE_BYTES {
        bail!(
            "env file {} is {} bytes, limit is {}",
            path.display(),
            meta.len(),
            MAX_ENV_FILE_BYTES
        );
    }
    std::fs::read_to_string(path).with_context(|| format!("read env file {}", path.display()))
}

/// Apply the file to the live environment. Runs on the restart path before
/// any application thread resumes, which is what makes the `set_var` calls
/// sound.
pub fn apply_env_file(path: &Path) -> Result<()> {
    let content = load_env_file(path)?;
    let actions = parse_env_file(&content, &|name| std::env::var(name).ok());
    for action in &actions {
        match action {
            EnvAction::Set { name, value } => unsafe { std::env::set_var(name, value) },
            EnvAction::Unset { name } => unsafe { std::env::remove_var(name) },
        }
    }
    tracing::debug!(
        "applied {} environment edit(s) from {}",
        actions.len(),
        path.display()
    );
    Ok(())
}
