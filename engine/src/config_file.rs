use std::path::Path;

use common::Value;
use errors::{Error, ErrorKind, Result};

/// Reads a YAML pipeline configuration, expanding `${NAME}` and
/// `$NAME` environment references in the text before parsing.
pub fn load_config_file<P: AsRef<Path>>(path: P) -> Result<Value> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|e| {
        Error::with_message(ErrorKind::Io, format!("reading {}", path.display()), Some(e))
    })?;

    let expanded = expand_env(&text);
    let yaml: serde_yaml::Value = serde_yaml::from_str(&expanded)?;
    Ok(Value::from_yaml(yaml))
}

/// Replaces `$NAME` and `${NAME}` with the named environment variable,
/// or with nothing when it is unset. A `$` not followed by a name is
/// kept literally; `${}` expands to nothing.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some((_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if !closed {
                    // Unterminated brace; keep the text as written.
                    out.push_str("${");
                    out.push_str(&name);
                } else if !name.is_empty() {
                    out.push_str(&std::env::var(&name).unwrap_or_default());
                }
            }
            Some((_, c)) if c.is_ascii_alphabetic() || *c == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || *c == '_' {
                        name.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }

    out
}
