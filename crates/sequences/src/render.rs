//! Personalization token substitution.
//!
//! Templates use single-brace `{key}` tokens. Rendering never fails: a key
//! that is missing or blank resolves through a static fallback table, then
//! to the empty string. Braces that do not enclose a well-formed key are
//! copied through untouched.

use std::collections::HashMap;

/// Fallback values for well-known keys.
fn fallback(key: &str) -> Option<&'static str> {
    match key {
        "first_name" | "full_name" | "name" => Some("there"),
        "company" => Some("your company"),
        "title" => Some("your role"),
        _ => None,
    }
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

pub fn render(template: &str, context: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) if close > 0 && after[..close].chars().all(is_key_char) => {
                let key = &after[..close];
                let value = context
                    .get(key)
                    .map(String::as_str)
                    .filter(|v| !v.trim().is_empty())
                    .or_else(|| fallback(key))
                    .unwrap_or("");
                out.push_str(value);
                rest = &after[close + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}
