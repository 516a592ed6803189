//! Variable substitution for Dockerfile arguments.
//!
//! Supports `$VAR`, `${VAR}`, `${VAR:-default}` and `${VAR:+alternate}`.
//! `\$` yields a literal `$`. Unknown variables expand to the empty string.

use std::collections::HashMap;

/// Variables visible to a step: build args overlaid by ENV values.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    vars: HashMap<String, String>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Expands variables in `input`.
    pub fn expand(&self, input: &str) -> Result<String, String> {
        expand(input, |name| self.get(name))
    }
}

/// Expands variables in `input` using `lookup`.
///
/// Returns an error message for an unterminated `${` or an empty name.
pub fn expand<'a, F>(input: &str, lookup: F) -> Result<String, String>
where
    F: Fn(&str) -> Option<&'a str>,
{
    expand_with(input, &lookup)
}

fn expand_with<'a>(input: &str, lookup: &dyn Fn(&str) -> Option<&'a str>) -> Result<String, String> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'$') => {
                chars.next();
                out.push('$');
            }
            '$' => match chars.peek() {
                Some('{') => {
                    chars.next();
                    let mut body = String::new();
                    let mut depth = 1;
                    loop {
                        match chars.next() {
                            Some('{') => {
                                depth += 1;
                                body.push('{');
                            }
                            Some('}') => {
                                depth -= 1;
                                if depth == 0 {
                                    break;
                                }
                                body.push('}');
                            }
                            Some(other) => body.push(other),
                            None => return Err(format!("unterminated variable in '{}'", input)),
                        }
                    }
                    out.push_str(&expand_braced(&body, lookup, input)?);
                }
                Some(next) if is_name_start(*next) => {
                    let mut name = String::new();
                    while let Some(&n) = chars.peek() {
                        if !is_name_char(n) {
                            break;
                        }
                        name.push(n);
                        chars.next();
                    }
                    out.push_str(lookup(&name).unwrap_or(""));
                }
                _ => out.push('$'),
            },
            other => out.push(other),
        }
    }

    Ok(out)
}

fn expand_braced<'a>(body: &str, lookup: &dyn Fn(&str) -> Option<&'a str>, input: &str) -> Result<String, String> {
    let (name, modifier) = match body.find(":-").or_else(|| body.find(":+")) {
        Some(idx) => (&body[..idx], Some((&body[idx..idx + 2], &body[idx + 2..]))),
        None => (body, None),
    };

    if name.is_empty() || !name.chars().all(is_name_char) {
        return Err(format!("invalid variable name '{}' in '{}'", name, input));
    }

    let value = lookup(name).filter(|v| !v.is_empty());
    match modifier {
        None => Ok(value.unwrap_or("").to_string()),
        Some((":-", word)) => match value {
            Some(v) => Ok(v.to_string()),
            None => expand_with(word, lookup),
        },
        Some((_, word)) => match value {
            Some(_) => expand_with(word, lookup),
            None => Ok(String::new()),
        },
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
