//! Template parameter resolution.
//!
//! Template bodies embed placeholders that are either positional (`{{1}}`) or
//! named (`{{order_id}}`). Given a per-recipient parameter mapping, resolution
//! produces the ordered list of substituted values for the send payload:
//!
//! - if the mapping covers every placeholder name, substitute by name in the
//!   order placeholders appear in the body;
//! - otherwise fall back to positional resolution: the i-th placeholder (left
//!   to right, 1-based) takes the mapping entry keyed `"i"`;
//! - a body with no placeholders resolves to an empty list regardless of the
//!   mapping; a mapping with no usable keys likewise resolves to empty.
//!
//! Pure: same body + same mapping always yields the same list, no I/O.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("valid placeholder regex"));

/// Placeholder names as they appear in the body, left to right.
pub fn placeholders(body: &str) -> Vec<&str> {
    PLACEHOLDER
        .captures_iter(body)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

/// Resolve the ordered parameter values for `body` from `params`.
pub fn resolve(body: &str, params: &BTreeMap<String, String>) -> Vec<String> {
    let names = placeholders(body);
    if names.is_empty() {
        return Vec::new();
    }

    // Named resolution requires every placeholder to be covered.
    if names.iter().all(|n| params.contains_key(*n)) {
        return names
            .iter()
            .map(|n| params[*n].clone())
            .collect();
    }

    // Positional fallback: "1", "2", ... satisfy placeholders in body order,
    // stopping at the first missing index.
    let mut values = Vec::new();
    for i in 1..=names.len() {
        match params.get(&i.to_string()) {
            Some(v) => values.push(v.clone()),
            None => break,
        }
    }
    values
}

/// Render the body text with `values` substituted for placeholders in order.
/// Placeholders beyond the value list are left as-is. Used for the message
/// history record, not for the wire payload.
pub fn render(body: &str, values: &[String]) -> String {
    let mut idx = 0usize;
    PLACEHOLDER
        .replace_all(body, |caps: &regex::Captures<'_>| {
            let out = match values.get(idx) {
                Some(v) => v.clone(),
                None => caps[0].to_string(),
            };
            idx += 1;
            out
        })
        .into_owned()
}
