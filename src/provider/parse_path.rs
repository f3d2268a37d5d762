//! Dot/bracket accessor paths into JSON responses.
//!
//! Provider configs describe where assistant text lives with a path like
//! `choices[0].message.content` or `content[0].text`; the walker
//! resolves it against the parsed body.

use serde_json::Value;

#[derive(Debug, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// Split a path into key and index segments.
///
/// Returns `None` on malformed paths (unclosed brackets, non-numeric
/// indexes, empty keys).
fn segments(path: &str) -> Option<Vec<Segment>> {
    let mut out = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return None;
        }
        let mut rest = part;
        // Leading name, if any ("[0]" alone is also allowed).
        if let Some(bracket) = rest.find('[') {
            if bracket > 0 {
                out.push(Segment::Key(rest[..bracket].to_string()));
            }
            rest = &rest[bracket..];
        } else {
            out.push(Segment::Key(rest.to_string()));
            continue;
        }
        // Remaining "[i][j]…" groups.
        while !rest.is_empty() {
            if !rest.starts_with('[') {
                return None;
            }
            let close = rest.find(']')?;
            let index = rest[1..close].parse::<usize>().ok()?;
            out.push(Segment::Index(index));
            rest = &rest[close + 1..];
        }
    }
    Some(out)
}

/// Resolve `path` against `value`, returning the referenced node.
pub fn walk<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in segments(path)? {
        current = match segment {
            Segment::Key(key) => current.get(key.as_str())?,
            Segment::Index(index) => current.get(index)?,
        };
    }
    Some(current)
}

/// Resolve `path` and return the string at it, if any.
pub fn walk_str<'a>(value: &'a Value, path: &str) -> Option<&'a str> {
    walk(value, path).and_then(Value::as_str)
}
