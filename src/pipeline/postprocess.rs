//! Post-processing: recover a JSON value from raw model output.
//!
//! Chat models asked for "JSON only" still wrap answers in ```json fences,
//! prefix them with a sentence, leave trailing commas, or stop mid-object when
//! they hit the token limit. The rules here run in order and stop at the
//! first one that yields valid JSON:
//!
//! 1. Strict parse of the trimmed text
//! 2. Strict parse of the first fenced code block
//! 3. The outermost `{…}` substring (or everything after the first `{` when
//!    the closing brace never arrived), with trailing commas removed and
//!    unclosed strings, braces and brackets closed in nesting order
//!
//! Anything else is reported as an error carrying the reason, which the
//! completion client turns into a repair request.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Parse a model response into JSON, salvaging common formatting mistakes.
pub fn parse_json_response(raw: &str) -> Result<Value, String> {
    let text = strip_invisible(raw);
    let text = text.trim();
    if text.is_empty() {
        return Err("empty response".into());
    }

    // ── Rule 1: strict ──
    let strict_err = match serde_json::from_str::<Value>(text) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };

    // ── Rule 2: fenced block ──
    if let Some(inner) = fenced_block(text) {
        if let Ok(v) = serde_json::from_str::<Value>(inner) {
            return Ok(v);
        }
        if let Some(v) = salvage_object(inner) {
            return Ok(v);
        }
    }

    // ── Rule 3: outermost object, repaired ──
    if let Some(v) = salvage_object(text) {
        return Ok(v);
    }

    Err(format!("not valid JSON ({strict_err})"))
}

static RE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?[ \t]*\n?(.*?)(?:```|$)").unwrap());

fn fenced_block(text: &str) -> Option<&str> {
    RE_FENCE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
}

fn salvage_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let tail = &text[start..];
    let outermost = match text.rfind('}') {
        Some(end) if end > start => &text[start..=end],
        _ => tail,
    };
    if let Ok(v) = serde_json::from_str::<Value>(outermost) {
        return Some(v);
    }
    // Repair the whole tail before the outermost slice: on a truncated answer
    // the last '}' closes an inner object and would drop everything after it.
    [tail, outermost]
        .iter()
        .find_map(|c| serde_json::from_str::<Value>(&repair(c)).ok())
}

fn repair(candidate: &str) -> String {
    close_unbalanced(&remove_trailing_commas(candidate))
}

static RE_TRAILING_COMMA: Lazy<Regex> = Lazy::new(|| Regex::new(r",\s*([}\]])").unwrap());

fn remove_trailing_commas(input: &str) -> String {
    RE_TRAILING_COMMA.replace_all(input, "$1").into_owned()
}

/// Append the closers a truncated document is missing, innermost first.
fn close_unbalanced(input: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in input.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.last() == Some(&c) {
                    stack.pop();
                }
            }
            _ => {}
        }
    }

    let mut out = input.to_string();
    if in_string {
        out.push('"');
    }
    if stack.is_empty() {
        return out;
    }
    // A dangling separator before the cut would survive closing.
    let trimmed_len = out.trim_end().trim_end_matches(',').len();
    out.truncate(trimmed_len);
    while let Some(closer) = stack.pop() {
        out.push(closer);
    }
    out
}

fn strip_invisible(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '\u{FEFF}' | '\u{200B}' | '\u{200C}' | '\u{200D}'))
        .collect()
}
