//! Outgoing text shaping and near-duplicate detection.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::ContextItem;

static DOUBLE_QUOTED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""([^"]*)""#).expect("valid regex"));
static SINGLE_QUOTED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"'([^']*)'").expect("valid regex"));

/// Messages shorter than this are never treated as duplicates.
const MIN_DEDUP_CHARS: usize = 2;

/// Full-width commas and curly quotes, as a chat member would type them.
pub fn normalize_punctuation(message: &str) -> String {
    let out = message.replace(',', "，");
    let out = DOUBLE_QUOTED.replace_all(&out, "“$1”");
    SINGLE_QUOTED.replace_all(&out, "‘$1’").into_owned()
}

/// Length difference plus positional mismatches over the shorter string,
/// counted in chars.
pub fn string_difference(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mismatches = a.iter().zip(b.iter()).filter(|(x, y)| x != y).count();
    a.len().abs_diff(b.len()) + mismatches
}

/// Whether `candidate` is close enough to something the bot already sent.
pub fn is_duplicate(candidate: &str, transcript: &[ContextItem], max_allowed_diff: usize) -> bool {
    if candidate.chars().count() < MIN_DEDUP_CHARS {
        return false;
    }
    transcript
        .iter()
        .filter_map(ContextItem::sent_text)
        .any(|sent| string_difference(candidate, sent) <= max_allowed_diff)
}

/// First `max` chars of `s`, with an ellipsis when cut.
pub fn preview(s: &str, max: usize) -> String {
    let mut out: String = s.chars().take(max).collect();
    if s.chars().count() > max {
        out.push_str("...");
    }
    out
}
