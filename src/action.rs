//! Action directive parsing.
//!
//! The backend embeds a structured negotiation directive in the reply text,
//! either inside a `<novoice>...</novoice>` span (a control-only block that
//! is never spoken) or as a bare `action: ...` line. The line format is
//! `action: sell | price: 150 | mood: greedy | note: wants a better deal`.
//! Headers on the buffered path carry the same fields; merging lives in the
//! gateway, this module only parses text.

use serde::Serialize;

const NOVOICE_OPEN: &str = "<novoice>";
const NOVOICE_CLOSE: &str = "</novoice>";

/// Structured action directive decoded from a reply.
///
/// Only the keys that were actually found are set; an absent `action:` line
/// yields an empty directive, not an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionDirective {
    pub action: Option<String>,
    pub price: Option<f64>,
    pub mood: Option<String>,
    pub note: Option<String>,
}

impl ActionDirective {
    pub fn is_empty(&self) -> bool {
        self.action.is_none() && self.price.is_none() && self.mood.is_none() && self.note.is_none()
    }
}

/// Extract an action directive from free-form reply text.
///
/// If both `<novoice>` tags are present, only the wrapped inner text is
/// considered. Lines are scanned from the last backward; the most recent
/// `action:` directive wins. Prose preceding `action:` on the same line is
/// stripped.
pub fn parse_action_line(text: &str) -> ActionDirective {
    let scope = novoice_span(text).unwrap_or(text);

    for line in scope.lines().rev() {
        if let Some(idx) = find_ci(line, "action:") {
            return parse_segments(&line[idx..]);
        }
    }
    ActionDirective::default()
}

/// Remove the `<novoice>...</novoice>` span from reply text.
///
/// The span carries control metadata only and must never reach the player
/// as displayed or spoken text.
pub fn strip_novoice(text: &str) -> String {
    match novoice_range(text) {
        Some((open, close)) => {
            let mut out = String::with_capacity(text.len());
            out.push_str(&text[..open]);
            out.push_str(&text[close + NOVOICE_CLOSE.len()..]);
            out.trim().to_string()
        }
        None => text.trim().to_string(),
    }
}

/// Inner text of the `<novoice>` span, if both tags are present.
fn novoice_span(text: &str) -> Option<&str> {
    let (open, close) = novoice_range(text)?;
    Some(&text[open + NOVOICE_OPEN.len()..close])
}

fn novoice_range(text: &str) -> Option<(usize, usize)> {
    let open = find_ci(text, NOVOICE_OPEN)?;
    let close_rel = find_ci(&text[open + NOVOICE_OPEN.len()..], NOVOICE_CLOSE)?;
    Some((open, open + NOVOICE_OPEN.len() + close_rel))
}

/// Case-insensitive substring search. The needles here are all ASCII, so
/// lowercasing preserves byte offsets.
fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    haystack.to_ascii_lowercase().find(needle)
}

/// Parse `action: x | price: 10 | mood: y | note: z` segments.
fn parse_segments(line: &str) -> ActionDirective {
    let mut directive = ActionDirective::default();

    for segment in line.split('|') {
        let mut parts = segment.splitn(2, ':');
        let key = match parts.next() {
            Some(k) => k.trim().to_ascii_lowercase(),
            None => continue,
        };
        let value = parts.next().map(str::trim).unwrap_or("");
        if value.is_empty() {
            continue;
        }

        match key.as_str() {
            "action" => directive.action = Some(value.to_string()),
            "price" => match value.parse::<f64>() {
                Ok(price) => directive.price = Some(price),
                Err(_) => log::warn!("Ignoring non-numeric price in action line: '{}'", value),
            },
            "mood" => directive.mood = Some(value.to_string()),
            "note" => directive.note = Some(value.to_string()),
            _ => {}
        }
    }
    directive
}
