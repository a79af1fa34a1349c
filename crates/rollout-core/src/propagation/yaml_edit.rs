//! In-place scalar edits on block-style YAML text.
//!
//! Only the bytes of the scalars that changed are rewritten, so comments,
//! key order and layout elsewhere in the file stay as they were. Anything
//! this module can't locate (flow collections, block scalars, anchors) makes
//! [`rewrite`] return `None` and the caller decides what to do instead.

use serde_json::Value;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seg {
    Key(String),
    Index(usize),
}

/// Rewrite `raw` so it parses to `new`, touching only the string leaves that
/// differ from `old`. Both slices hold one value per document, in file order.
pub(crate) fn rewrite(raw: &str, old: &[Value], new: &[Value]) -> Option<String> {
    let docs = documents(raw);
    if docs.len() != old.len() || old.len() != new.len() {
        return None;
    }

    let mut edits: Vec<(Range<usize>, String)> = Vec::new();
    for ((block, before), after) in docs.iter().zip(old).zip(new) {
        for (path, value) in changed_strings(before, after)? {
            let span = locate(block, before, &path)?;
            let text = render(&raw[span.clone()], &value);
            edits.push((span, text));
        }
    }

    edits.sort_by_key(|(span, _)| std::cmp::Reverse(span.start));
    let mut out = raw.to_string();
    for (span, text) in edits {
        out.replace_range(span, &text);
    }
    Some(out)
}

// ---------------------------------------------------------------------------
// Structural diff
// ---------------------------------------------------------------------------

/// Leaf strings that differ between `old` and `new`, or `None` when anything
/// other than a string leaf changed.
fn changed_strings(old: &Value, new: &Value) -> Option<Vec<(Vec<Seg>, String)>> {
    let mut out = Vec::new();
    diff(old, new, &mut Vec::new(), &mut out).then_some(out)
}

fn diff(old: &Value, new: &Value, path: &mut Vec<Seg>, out: &mut Vec<(Vec<Seg>, String)>) -> bool {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            if a.len() != b.len() {
                return false;
            }
            a.iter().all(|(k, va)| {
                let Some(vb) = b.get(k) else {
                    return false;
                };
                path.push(Seg::Key(k.clone()));
                let same_shape = diff(va, vb, path, out);
                path.pop();
                same_shape
            })
        }
        (Value::Array(a), Value::Array(b)) => {
            if a.len() != b.len() {
                return false;
            }
            a.iter().zip(b).enumerate().all(|(i, (va, vb))| {
                path.push(Seg::Index(i));
                let same_shape = diff(va, vb, path, out);
                path.pop();
                same_shape
            })
        }
        (Value::String(a), Value::String(b)) => {
            if a != b {
                out.push((path.clone(), b.clone()));
            }
            true
        }
        (a, b) => a == b,
    }
}

// ---------------------------------------------------------------------------
// Lines
// ---------------------------------------------------------------------------

/// The content part of one line, or of the remainder of a line after a key
/// or a sequence dash.
#[derive(Debug, Clone, Copy)]
struct Slot<'a> {
    /// Column of the first content character.
    col: usize,
    /// Byte offset of `text` within the file.
    offset: usize,
    text: &'a str,
}

/// Meaningful lines grouped by document. Blank lines, comment lines,
/// directives and document markers are dropped.
fn documents(raw: &str) -> Vec<Vec<Slot<'_>>> {
    let mut docs = Vec::new();
    let mut current = Vec::new();
    let mut start = 0;
    for line in raw.split_inclusive('\n') {
        let offset = start;
        start += line.len();
        let line = line.trim_end_matches(['\n', '\r']);
        let text = line.trim_start_matches(' ');
        let col = line.len() - text.len();
        if col == 0 && (is_marker(text, "---") || is_marker(text, "...")) {
            if !current.is_empty() {
                docs.push(std::mem::take(&mut current));
            }
            continue;
        }
        if text.is_empty() || text.starts_with('#') || (col == 0 && text.starts_with('%')) {
            continue;
        }
        current.push(Slot {
            col,
            offset: offset + col,
            text,
        });
    }
    if !current.is_empty() {
        docs.push(current);
    }
    docs
}

fn is_marker(text: &str, marker: &str) -> bool {
    text.strip_prefix(marker)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with([' ', '\t']))
}

fn is_dash(text: &str) -> bool {
    text == "-" || text.starts_with("- ")
}

/// Advance `slot` past `consumed` bytes and any following spaces.
fn advance(slot: Slot<'_>, consumed: usize) -> Slot<'_> {
    let rest = &slot.text[consumed..];
    let text = rest.trim_start_matches(' ');
    let skipped = consumed + (rest.len() - text.len());
    let text = if text.starts_with('#') { "" } else { text };
    Slot {
        col: slot.col + slot.text[..skipped].chars().count(),
        offset: slot.offset + skipped,
        text,
    }
}

// ---------------------------------------------------------------------------
// Locating a scalar
// ---------------------------------------------------------------------------

/// Byte range of the scalar at `path`, where `node` is the parsed value the
/// lines in `block` describe.
fn locate(block: &[Slot<'_>], node: &Value, path: &[Seg]) -> Option<Range<usize>> {
    let col = block.first()?.col;
    match (node, path.first()?) {
        (Value::Object(map), Seg::Key(key)) => {
            let child = map.get(key)?;
            for (i, slot) in block.iter().enumerate() {
                if slot.col != col || is_dash(slot.text) {
                    continue;
                }
                let Some(inline) = entry_value(*slot, key) else {
                    continue;
                };
                // A sequence may sit at the same column as its key.
                let end = block[i + 1..]
                    .iter()
                    .position(|s| s.col < col || (s.col == col && !is_dash(s.text)))
                    .map_or(block.len(), |p| i + 1 + p);
                return locate_value(inline, &block[i + 1..end], child, &path[1..]);
            }
            None
        }
        (Value::Array(items), Seg::Index(idx)) => {
            let child = items.get(*idx)?;
            let mut n = 0;
            for (i, slot) in block.iter().enumerate() {
                if slot.col != col {
                    continue;
                }
                if !is_dash(slot.text) {
                    return None;
                }
                if n == *idx {
                    let inline = advance(*slot, 1);
                    let end = block[i + 1..]
                        .iter()
                        .position(|s| s.col <= col)
                        .map_or(block.len(), |p| i + 1 + p);
                    return locate_value(inline, &block[i + 1..end], child, &path[1..]);
                }
                n += 1;
            }
            None
        }
        _ => None,
    }
}

fn locate_value(
    inline: Slot<'_>,
    children: &[Slot<'_>],
    node: &Value,
    rest: &[Seg],
) -> Option<Range<usize>> {
    if rest.is_empty() {
        // Multi-line plain scalars are not edited in place.
        if !children.is_empty() {
            return None;
        }
        return scalar_span(inline);
    }
    let mut block = Vec::with_capacity(children.len() + 1);
    if !inline.text.is_empty() {
        block.push(inline);
    }
    block.extend_from_slice(children);
    locate(&block, node, rest)
}

/// If `slot` is the mapping entry for `key`, the slot of its inline value.
fn entry_value<'a>(slot: Slot<'a>, key: &str) -> Option<Slot<'a>> {
    let text = slot.text;
    let (found, key_len) = match text.chars().next()? {
        '"' => {
            let len = double_quoted_len(text)?;
            (serde_json::from_str::<String>(&text[..len]).ok()?, len)
        }
        '\'' => {
            let len = single_quoted_len(text)?;
            (text[1..len - 1].replace("''", "'"), len)
        }
        _ => {
            let colon = text
                .match_indices(':')
                .map(|(i, _)| i)
                .find(|&i| text[i + 1..].is_empty() || text[i + 1..].starts_with([' ', '\t']))?;
            (text[..colon].trim_end().to_string(), colon)
        }
    };
    if found != key {
        return None;
    }
    let after = text[key_len..].trim_start_matches(' ');
    let colon_at = text.len() - after.len();
    let rest = after.strip_prefix(':')?;
    if !(rest.is_empty() || rest.starts_with([' ', '\t'])) {
        return None;
    }
    Some(advance(slot, colon_at + 1))
}

fn scalar_span(slot: Slot<'_>) -> Option<Range<usize>> {
    let text = slot.text;
    let len = match text.chars().next()? {
        '"' => double_quoted_len(text)?,
        '\'' => single_quoted_len(text)?,
        '|' | '>' | '{' | '[' | '&' | '*' | '!' | '#' => return None,
        _ => {
            let end = text.find(" #").unwrap_or(text.len());
            text[..end].trim_end().len()
        }
    };
    Some(slot.offset..slot.offset + len)
}

/// Length of the leading `"..."` including both quotes.
fn double_quoted_len(text: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in text.char_indices().skip(1) {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return Some(i + 1),
            _ => {}
        }
    }
    None
}

/// Length of the leading `'...'` including both quotes; `''` is an escaped quote.
fn single_quoted_len(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 1;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            if bytes.get(i + 1) == Some(&b'\'') {
                i += 2;
                continue;
            }
            return Some(i + 1);
        }
        i += 1;
    }
    None
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Render `value` in the quoting style of the scalar it replaces, falling
/// back to double quotes when the plain form would read differently.
fn render(old: &str, value: &str) -> String {
    match old.as_bytes().first() {
        Some(b'\'') if !value.contains('\n') => format!("'{}'", value.replace('\'', "''")),
        Some(b'"') => double_quoted(value),
        _ if plain_is_safe(value) => value.to_string(),
        _ => double_quoted(value),
    }
}

fn double_quoted(value: &str) -> String {
    Value::String(value.to_string()).to_string()
}

fn plain_is_safe(value: &str) -> bool {
    !value.is_empty()
        && value.trim() == value
        && !value.contains(['\n', '#', '"', '\''])
        && matches!(serde_yaml::from_str::<Value>(value), Ok(Value::String(s)) if s == value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse_all(raw: &str) -> Vec<Value> {
        use serde::Deserialize;
        serde_yaml::Deserializer::from_str(raw)
            .map(|d| Value::deserialize(d).unwrap())
            .collect()
    }

    fn edit(raw: &str, change: impl FnOnce(&mut Vec<Value>)) -> Option<String> {
        let old = parse_all(raw);
        let mut new = old.clone();
        change(&mut new);
        rewrite(raw, &old, &new)
    }

    #[test]
    fn plain_scalar_keeps_comment_and_neighbours() {
        let raw = "\
apiVersion: v1
kind: ConfigMap
# owned by the identity team
metadata:
  name: kc
data:
  KC_HOSTNAME: old.example   # set at bootstrap
  A_FIRST: keep
";
        let out = edit(raw, |d| d[0]["data"]["KC_HOSTNAME"] = json!("lb.example.com")).unwrap();
        assert_eq!(out, raw.replace("old.example", "lb.example.com"));
    }

    #[test]
    fn quoting_style_is_kept() {
        let raw = "a: 'old'\nb: \"old\"\n";
        let out = edit(raw, |d| {
            d[0]["a"] = json!("it's");
            d[0]["b"] = json!("new");
        })
        .unwrap();
        assert_eq!(out, "a: 'it''s'\nb: \"new\"\n");
    }

    #[test]
    fn plain_value_that_would_misread_is_quoted() {
        let out = edit("host: old\n", |d| d[0]["host"] = json!("a: b")).unwrap();
        assert_eq!(out, "host: \"a: b\"\n");
        assert_eq!(parse_all(&out)[0]["host"], "a: b");
    }

    #[test]
    fn sequence_entries_at_key_column() {
        let raw = "spec:\n  args:\n  - LOG=info\n  - ISSUER=http://old/realms/core  # issuer\n  - Z=1\n";
        let out = edit(raw, |d| {
            d[0]["spec"]["args"][1] = json!("ISSUER=http://lb/realms/core");
        })
        .unwrap();
        assert_eq!(out, raw.replace("http://old/", "http://lb/"));
    }

    #[test]
    fn mapping_inside_sequence_item() {
        let raw = "\
spec:
  source:
    helm:
      parameters:
        - name: host
          value: old.example
        - name: port
          value: \"8080\"
";
        let out = edit(raw, |d| {
            d[0]["spec"]["source"]["helm"]["parameters"][0]["value"] = json!("lb.example");
        })
        .unwrap();
        assert_eq!(out, raw.replace("old.example", "lb.example"));
    }

    #[test]
    fn second_document_is_addressed_by_position() {
        let raw = "# first\nkind: Service\n---\nkind: ConfigMap\ndata:\n  HOST: old\n";
        let out = edit(raw, |d| d[1]["data"]["HOST"] = json!("new")).unwrap();
        assert_eq!(out, "# first\nkind: Service\n---\nkind: ConfigMap\ndata:\n  HOST: new\n");
    }

    #[test]
    fn unsupported_layouts_are_refused() {
        assert!(edit("data: {HOST: old}\n", |d| d[0]["data"]["HOST"] = json!("new")).is_none());
        assert!(edit("note: |\n  old\n", |d| d[0]["note"] = json!("new\n")).is_none());
        // Structural changes are not scalar edits.
        assert!(edit("a: x\n", |d| d[0]["b"] = json!("y")).is_none());
    }
}
