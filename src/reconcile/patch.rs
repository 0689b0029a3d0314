//! In-place edits of manifest source text
//!
//! Rewritten string values are spliced into the original text so the rest
//! of the file (indentation, inline arrays, escapes) is left byte-for-byte.

use serde_json::Value;
use std::ops::Range;

type Pointer = Vec<String>;

/// String leaves whose value differs between `before` and `after`
fn changed_strings(before: &Value, after: &Value, path: &mut Pointer, out: &mut Vec<(Pointer, String)>) {
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, value) in new {
                if let Some(previous) = old.get(key) {
                    path.push(key.clone());
                    changed_strings(previous, value, path, out);
                    path.pop();
                }
            }
        }
        (Value::Array(old), Value::Array(new)) => {
            for (i, (previous, value)) in old.iter().zip(new).enumerate() {
                path.push(i.to_string());
                changed_strings(previous, value, path, out);
                path.pop();
            }
        }
        (Value::String(old), Value::String(new)) if old != new => {
            out.push((path.clone(), new.clone()));
        }
        _ => {}
    }
}

/// Byte spans of every string value in a JSON document, keyed by location
struct Spans<'a> {
    text: &'a [u8],
    pos: usize,
    path: Pointer,
    found: Vec<(Pointer, Range<usize>)>,
}

impl<'a> Spans<'a> {
    fn collect(text: &'a str) -> Option<Vec<(Pointer, Range<usize>)>> {
        let mut spans = Spans {
            text: text.as_bytes(),
            pos: 0,
            path: Vec::new(),
            found: Vec::new(),
        };
        spans.value()?;
        Some(spans.found)
    }

    fn peek(&self) -> Option<u8> {
        self.text.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn consume(&mut self, byte: u8) -> Option<()> {
        self.skip_ws();
        (self.peek()? == byte).then(|| self.pos += 1)
    }

    fn string(&mut self) -> Option<Range<usize>> {
        let start = self.pos;
        self.pos += 1;
        loop {
            match self.peek()? {
                b'\\' => self.pos += 2,
                b'"' => {
                    self.pos += 1;
                    return Some(start..self.pos);
                }
                _ => self.pos += 1,
            }
        }
    }

    fn value(&mut self) -> Option<()> {
        self.skip_ws();
        match self.peek()? {
            b'{' => {
                self.pos += 1;
                self.skip_ws();
                if self.peek()? == b'}' {
                    self.pos += 1;
                    return Some(());
                }
                loop {
                    self.skip_ws();
                    let key_span = self.string()?;
                    let text = std::str::from_utf8(&self.text[key_span]).ok()?;
                    let key: String = serde_json::from_str(text).ok()?;
                    self.consume(b':')?;
                    self.path.push(key);
                    self.value()?;
                    self.path.pop();
                    if !self.separator(b'}')? {
                        return Some(());
                    }
                }
            }
            b'[' => {
                self.pos += 1;
                self.skip_ws();
                if self.peek()? == b']' {
                    self.pos += 1;
                    return Some(());
                }
                let mut index = 0usize;
                loop {
                    self.path.push(index.to_string());
                    self.value()?;
                    self.path.pop();
                    index += 1;
                    if !self.separator(b']')? {
                        return Some(());
                    }
                }
            }
            b'"' => {
                let span = self.string()?;
                self.found.push((self.path.clone(), span));
                Some(())
            }
            _ => {
                while !matches!(self.peek(), None | Some(b',' | b']' | b'}' | b' ' | b'\t' | b'\r' | b'\n')) {
                    self.pos += 1;
                }
                Some(())
            }
        }
    }

    /// `true` after a comma, `false` after the closing bracket
    fn separator(&mut self, close: u8) -> Option<bool> {
        self.skip_ws();
        let byte = self.peek()?;
        self.pos += 1;
        match byte {
            b',' => Some(true),
            b if b == close => Some(false),
            _ => None,
        }
    }
}

/// Splice the string changes between `before` and `after` into `source`
///
/// Returns `None` when the text cannot be patched so that it parses back
/// to exactly `after`; callers then re-serialize instead.
pub fn patch_source(source: &str, before: &Value, after: &Value) -> Option<String> {
    let mut changes = Vec::new();
    changed_strings(before, after, &mut Vec::new(), &mut changes);

    let spans = Spans::collect(source)?;
    let mut edits: Vec<(Range<usize>, String)> = Vec::new();
    for (pointer, value) in &changes {
        let (_, span) = spans.iter().find(|(p, _)| p == pointer)?;
        edits.push((span.clone(), serde_json::to_string(value).ok()?));
    }
    edits.sort_by_key(|(span, _)| std::cmp::Reverse(span.start));

    let mut out = source.to_string();
    for (span, literal) in edits {
        out.replace_range(span, &literal);
    }

    let reparsed: Value = serde_json::from_str(&out).ok()?;
    (reparsed == *after).then_some(out)
}
