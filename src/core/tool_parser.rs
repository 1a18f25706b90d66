//! Textual tool-call protocol.
//!
//! The model asks for a tool with a single line
//! `TOOL_CALL: name | key=value | key=value` and is answered with
//! `TOOL_RESULT: name | key=value | status=success | output=...`.
//!
//! - `|` separates fields; `\|` and `\\` escape the separator and the escape
//!   character itself. Any other backslash is literal.
//! - A value that opens with three or more backticks is a fence. Its content is
//!   taken verbatim (no escaping) up to the first run of the same length, so a
//!   fenced value may span lines. A language tag on the opening line is dropped.
//! - Unfenced values are trimmed.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::collections::btree_map;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tools::spec::ToolResult;

pub const CALL_MARKER: &str = "TOOL_CALL:";
pub const RESULT_MARKER: &str = "TOOL_RESULT:";

const MIN_FENCE: usize = 3;

// === Arguments ===

/// A single argument value. The wire format is text; byte values are carried
/// as UTF-8 when possible and as `base64:` text otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl ArgValue {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Bytes(_) => None,
        }
    }

    /// Text used on the wire.
    #[must_use]
    pub fn to_wire(&self) -> Cow<'_, str> {
        match self {
            Self::Text(text) => Cow::Borrowed(text),
            Self::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => Cow::Borrowed(text),
                Err(_) => Cow::Owned(format!("base64:{}", STANDARD.encode(bytes))),
            },
        }
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Vec<u8>> for ArgValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

/// Argument map of a tool call. Ordered by key so rendering is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolArgs(BTreeMap<String, ArgValue>);

impl ToolArgs {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, handy in tests and adapters.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ArgValue>) -> Option<ArgValue> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<ArgValue> {
        self.0.remove(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(ArgValue::as_text)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, ArgValue> {
        self.0.iter()
    }
}

impl<'a> IntoIterator for &'a ToolArgs {
    type Item = (&'a String, &'a ArgValue);
    type IntoIter = btree_map::Iter<'a, String, ArgValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<ArgValue>> FromIterator<(K, V)> for ToolArgs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

// === Calls ===

/// A decoded tool request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub args: ToolArgs,
    /// Source text of the call, kept for the audit log.
    pub raw: String,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("malformed tool call: {reason}")]
pub struct DecodeError {
    /// Tool name, when the call got far enough to have one.
    pub name: Option<String>,
    pub reason: String,
    pub raw: String,
}

impl DecodeError {
    /// Stand-in call so the failed line still gets exactly one result.
    #[must_use]
    pub fn placeholder_call(&self) -> ToolCall {
        ToolCall {
            name: self.name.clone().unwrap_or_else(|| "unknown".to_string()),
            args: ToolArgs::new(),
            raw: self.raw.clone(),
        }
    }
}

// === Decoding ===

/// Lazily decode every tool call in `text`, in textual order.
#[must_use]
pub fn decode_calls(text: &str) -> DecodeCalls<'_> {
    DecodeCalls { text, pos: 0 }
}

/// Iterator returned by [`decode_calls`].
#[derive(Debug)]
pub struct DecodeCalls<'a> {
    text: &'a str,
    pos: usize,
}

impl Iterator for DecodeCalls<'_> {
    type Item = Result<ToolCall, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let span = next_call(self.text, self.pos)?;
        self.pos = span.end;
        Some(span.result)
    }
}

/// Whether `text` contains at least one call marker at the start of a line.
#[must_use]
pub fn contains_tool_call(text: &str) -> bool {
    find_marker(text, 0, CALL_MARKER).is_some()
}

/// Remove every call (including its fenced payloads) from `text`.
#[must_use]
pub fn strip_tool_calls(text: &str) -> String {
    let mut kept = String::with_capacity(text.len());
    let mut cursor = 0;
    while let Some(span) = next_call(text, cursor) {
        kept.push_str(&text[cursor..span.start]);
        cursor = span.end;
    }
    kept.push_str(&text[cursor..]);

    let mut out = String::with_capacity(kept.len());
    let mut blank_run = false;
    for line in kept.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            if !blank_run && !out.is_empty() {
                out.push('\n');
            }
            blank_run = true;
            continue;
        }
        blank_run = false;
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}

struct CallSpan {
    start: usize,
    end: usize,
    result: Result<ToolCall, DecodeError>,
}

fn next_call(text: &str, from: usize) -> Option<CallSpan> {
    let start = find_marker(text, from, CALL_MARKER)?;
    let scan = scan_fields(text, start + CALL_MARKER.len());
    let raw = text[start..scan.end].trim_end().to_string();
    let result = match build_call(scan.fields, scan.error) {
        Ok((name, args)) => Ok(ToolCall { name, args, raw }),
        Err((name, reason)) => Err(DecodeError { name, reason, raw }),
    };
    Some(CallSpan {
        start,
        end: scan.end,
        result,
    })
}

/// Byte offset of the next `marker` that only has whitespace before it on its line.
fn find_marker(text: &str, from: usize, marker: &str) -> Option<usize> {
    let mut search = from;
    while let Some(rel) = text[search..].find(marker) {
        let idx = search + rel;
        let line_start = text[..idx].rfind('\n').map_or(0, |i| i + 1);
        if text[line_start..idx].chars().all(|c| c == ' ' || c == '\t') {
            return Some(idx);
        }
        search = idx + marker.len();
    }
    None
}

#[derive(Debug, Default)]
struct RawField {
    key: String,
    value: String,
    has_eq: bool,
    fenced: bool,
}

impl RawField {
    fn push(&mut self, ch: char) {
        if self.has_eq {
            self.value.push(ch);
        } else if ch == '=' {
            self.has_eq = true;
        } else {
            self.key.push(ch);
        }
    }

    fn awaits_value(&self) -> bool {
        self.has_eq && !self.fenced && self.value.trim().is_empty()
    }
}

struct Scan {
    fields: Vec<RawField>,
    end: usize,
    error: Option<String>,
}

fn scan_fields(text: &str, mut pos: usize) -> Scan {
    let bytes = text.as_bytes();
    let mut fields = Vec::new();
    let mut field = RawField::default();
    let mut error = None;

    let end = loop {
        let Some(&byte) = bytes.get(pos) else {
            break text.len();
        };
        if field.fenced && byte != b'|' && byte != b'\n' {
            let Some(ch) = text[pos..].chars().next() else {
                break text.len();
            };
            if !ch.is_whitespace() {
                error.get_or_insert_with(|| {
                    format!("unexpected text after fence for `{}`", field.key.trim())
                });
            }
            pos += ch.len_utf8();
            continue;
        }
        match byte {
            b'\\' => match bytes.get(pos + 1) {
                Some(b'|') => {
                    field.push('|');
                    pos += 2;
                }
                Some(b'\\') => {
                    field.push('\\');
                    pos += 2;
                }
                _ => {
                    field.push('\\');
                    pos += 1;
                }
            },
            b'|' => {
                fields.push(std::mem::take(&mut field));
                pos += 1;
            }
            b'\n' => {
                if field.awaits_value()
                    && let Some(fence_start) = fence_on_next_line(text, pos + 1)
                {
                    pos = fence_start;
                    continue;
                }
                break pos;
            }
            b'`' if field.awaits_value() && backtick_run(bytes, pos) >= MIN_FENCE => {
                match read_fence(text, pos) {
                    Some((content, after)) => {
                        field.value = content;
                        field.fenced = true;
                        pos = after;
                    }
                    None => {
                        error.get_or_insert_with(|| {
                            format!("unterminated fence for `{}`", field.key.trim())
                        });
                        break text[pos..].find('\n').map_or(text.len(), |i| pos + i);
                    }
                }
            }
            _ => {
                let Some(ch) = text[pos..].chars().next() else {
                    break text.len();
                };
                field.push(ch);
                pos += ch.len_utf8();
            }
        }
    };
    fields.push(field);

    Scan { fields, end, error }
}

fn backtick_run(bytes: &[u8], pos: usize) -> usize {
    bytes[pos..].iter().take_while(|b| **b == b'`').count()
}

fn fence_on_next_line(text: &str, line_start: usize) -> Option<usize> {
    let line = &text[line_start..];
    let indent = line.len() - line.trim_start_matches([' ', '\t']).len();
    let start = line_start + indent;
    (backtick_run(text.as_bytes(), start) >= MIN_FENCE).then_some(start)
}

/// Read a fence opening at `pos`. Returns the content and the offset after the closing run.
fn read_fence(text: &str, pos: usize) -> Option<(String, usize)> {
    let len = backtick_run(text.as_bytes(), pos);
    let open_end = pos + len;
    let closer = "`".repeat(len);
    let close = open_end + text[open_end..].find(&closer)?;
    let inner = &text[open_end..close];

    let content = match inner.split_once('\n') {
        None => inner,
        Some((first, rest)) => {
            let body = if is_fence_tag(first) { rest } else { inner };
            body.strip_suffix('\n').unwrap_or(body)
        }
    };
    Some((content.to_string(), close + len))
}

fn is_fence_tag(line: &str) -> bool {
    line.trim()
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '+' | '_' | '.' | '#'))
}

fn is_identifier(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

type Decoded = Result<(String, ToolArgs), (Option<String>, String)>;

fn build_call(fields: Vec<RawField>, scan_error: Option<String>) -> Decoded {
    let mut fields = fields.into_iter();
    let head = fields.next().unwrap_or_default();
    let name = head.key.trim().to_string();
    if head.has_eq || !is_identifier(&name) {
        let reason = if name.is_empty() && !head.has_eq {
            "missing tool name".to_string()
        } else {
            format!("invalid tool name `{}`", name)
        };
        return Err((None, reason));
    }
    if let Some(reason) = scan_error {
        return Err((Some(name), reason));
    }

    let mut args = ToolArgs::new();
    for field in fields {
        let key = field.key.trim();
        if !field.has_eq {
            if key.is_empty() {
                continue;
            }
            return Err((Some(name), format!("argument `{key}` is missing `=`")));
        }
        if !is_identifier(key) {
            return Err((Some(name), format!("invalid argument name `{key}`")));
        }
        let value = if field.fenced {
            field.value
        } else {
            field.value.trim().to_string()
        };
        args.insert(key, value);
    }
    Ok((name, args))
}

// === Encoding ===

/// Render a result line for the next prompt.
#[must_use]
pub fn encode_result(result: &ToolResult) -> String {
    let mut out = format!("{RESULT_MARKER} {}", result.tool);
    for (key, value) in &result.args {
        if key == "status" || key == "output" {
            continue;
        }
        push_field(&mut out, key, &value.to_wire());
    }
    push_field(&mut out, "status", result.status.as_str());
    push_field(&mut out, "output", &result.output);
    out
}

/// Render a call in wire form.
#[must_use]
pub fn encode_call(call: &ToolCall) -> String {
    let mut out = format!("{CALL_MARKER} {}", call.name);
    for (key, value) in &call.args {
        push_field(&mut out, key, &value.to_wire());
    }
    out
}

/// Rewrite an encoded result so it decodes as a call.
#[must_use]
pub fn result_as_model_output(encoded: &str) -> String {
    match encoded.strip_prefix(RESULT_MARKER) {
        Some(rest) => format!("{CALL_MARKER}{rest}"),
        None => encoded.to_string(),
    }
}

fn push_field(out: &mut String, key: &str, value: &str) {
    out.push_str(" | ");
    out.push_str(key);
    out.push('=');
    out.push_str(&encode_value(value));
}

fn encode_value(value: &str) -> Cow<'_, str> {
    if needs_fence(value) {
        let longest = longest_backtick_run(value);
        let fence = "`".repeat((longest + 1).max(MIN_FENCE));
        Cow::Owned(format!("{fence}\n{value}\n{fence}"))
    } else if value.contains(['|', '\\']) {
        Cow::Owned(value.replace('\\', "\\\\").replace('|', "\\|"))
    } else {
        Cow::Borrowed(value)
    }
}

fn needs_fence(value: &str) -> bool {
    value.contains(['\n', '\r']) || value.starts_with('`') || value.trim() != value
}

fn longest_backtick_run(value: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for ch in value.chars() {
        if ch == '`' {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::spec::ToolStatus;
    use pretty_assertions::assert_eq;

    fn decode_ok(text: &str) -> Vec<ToolCall> {
        decode_calls(text)
            .map(|call| call.expect("call should decode"))
            .collect()
    }

    #[test]
    fn decodes_simple_call() {
        let calls = decode_ok("Let me look.\nTOOL_CALL: list_directory | path=src/\n");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "list_directory");
        assert_eq!(calls[0].args.get_str("path"), Some("src/"));
        assert_eq!(calls[0].raw, "TOOL_CALL: list_directory | path=src/");
    }

    #[test]
    fn prose_after_the_call_line_is_not_an_argument() {
        let calls = decode_ok("TOOL_CALL: read_file | path=a.txt\nI will summarise it next.");
        assert_eq!(calls[0].args.get_str("path"), Some("a.txt"));
    }

    #[test]
    fn marker_inside_prose_is_ignored() {
        assert!(!contains_tool_call("Use the TOOL_CALL: syntax to ask."));
        assert_eq!(decode_calls("Use the TOOL_CALL: syntax").count(), 0);
        assert!(contains_tool_call("  TOOL_CALL: read_file | path=x"));
    }

    #[test]
    fn unescapes_separator_and_backslash() {
        let calls = decode_ok(r"TOOL_CALL: run_command | command=grep a\|b C:\\dir \n");
        assert_eq!(calls[0].args.get_str("command"), Some(r"grep a|b C:\dir \n"));
    }

    #[test]
    fn fenced_value_spans_lines_and_drops_language_tag() {
        let text = "TOOL_CALL: write_file | path=main.py | content=```python\nprint('a | b')\n\\n\n``` | mode=overwrite\nDone.";
        let calls = decode_ok(text);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args.get_str("content"), Some("print('a | b')\n\\n"));
        assert_eq!(calls[0].args.get_str("mode"), Some("overwrite"));
    }

    #[test]
    fn fence_may_open_on_the_next_line() {
        let text = "TOOL_CALL: write_file | path=notes.md | content=\n```\n# Title\nbody\n```\n";
        let calls = decode_ok(text);
        assert_eq!(calls[0].args.get_str("content"), Some("# Title\nbody"));
    }

    #[test]
    fn malformed_call_does_not_stop_decoding() {
        let text = "TOOL_CALL: read_file | pathmissing\nTOOL_CALL: | x=1\nTOOL_CALL: list_directory | path=.";
        let results: Vec<_> = decode_calls(text).collect();
        assert_eq!(results.len(), 3);

        let first = results[0].as_ref().unwrap_err();
        assert_eq!(first.name.as_deref(), Some("read_file"));
        assert!(first.reason.contains("pathmissing"));
        assert_eq!(first.placeholder_call().name, "read_file");

        let second = results[1].as_ref().unwrap_err();
        assert_eq!(second.name, None);
        assert_eq!(second.placeholder_call().name, "unknown");

        assert_eq!(results[2].as_ref().unwrap().name, "list_directory");
    }

    #[test]
    fn unterminated_fence_is_reported_and_next_call_survives() {
        let text = "TOOL_CALL: write_file | path=a | content=```\nnever closed\nTOOL_CALL: read_file | path=b";
        let results: Vec<_> = decode_calls(text).collect();
        assert_eq!(results.len(), 2);
        let err = results[0].as_ref().unwrap_err();
        assert!(err.reason.contains("unterminated fence"));
        assert_eq!(results[1].as_ref().unwrap().args.get_str("path"), Some("b"));
    }

    #[test]
    fn trailing_separator_is_tolerated() {
        let calls = decode_ok("TOOL_CALL: list_directory | path=src |");
        assert_eq!(calls[0].args.len(), 1);
    }

    #[test]
    fn encodes_result_with_escapes() {
        let result = ToolResult::success(
            "run_command",
            ToolArgs::new().with("command", "ls | wc"),
            r"C:\out",
        );
        assert_eq!(
            encode_result(&result),
            r"TOOL_RESULT: run_command | command=ls \| wc | status=success | output=C:\\out"
        );
    }

    #[test]
    fn encode_fences_multiline_and_padded_values() {
        let result = ToolResult::error("read_file", ToolArgs::new(), "line1\nline2");
        assert_eq!(
            encode_result(&result),
            "TOOL_RESULT: read_file | status=error | output=```\nline1\nline2\n```"
        );
        assert_eq!(encode_value("  padded"), "```\n  padded\n```");
        assert_eq!(encode_value("has ``` inside\nx"), "````\nhas ``` inside\nx\n````");
    }

    #[test]
    fn result_round_trips_through_decoder() {
        let tricky = [
            "plain",
            "",
            "pipe | and \\ backslash \\|",
            "multi\nline\n",
            "\nleading newline",
            "  spaced  ",
            "`tick` start",
            "ends with ``",
            "```\nfenced inside\n```",
            "tab\tand\r\ncrlf\r",
            "unicode é ✓ | done",
            "TOOL_CALL: fake | x=1\nTOOL_RESULT: fake",
        ];
        for value in tricky {
            let args = ToolArgs::new().with("path", value).with("extra", "a|b");
            let result = ToolResult::new("echo_tool", args.clone(), ToolStatus::Blocked, value);

            let wire = result_as_model_output(&encode_result(&result));
            let calls = decode_ok(&wire);
            assert_eq!(calls.len(), 1, "value {value:?} produced {wire:?}");

            let mut expected = args;
            expected.insert("status", "blocked");
            expected.insert("output", value);
            assert_eq!(calls[0].name, "echo_tool");
            assert_eq!(calls[0].args, expected, "value {value:?}");
        }
    }

    #[test]
    fn encode_call_decodes_back() {
        let call = ToolCall {
            name: "write_file".to_string(),
            args: ToolArgs::new()
                .with("path", "src/lib.rs")
                .with("content", "fn main() {}\n// a | b"),
            raw: String::new(),
        };
        let decoded = decode_ok(&encode_call(&call));
        assert_eq!(decoded[0].args, call.args);
    }

    #[test]
    fn bytes_values_use_utf8_or_base64_on_the_wire() {
        assert_eq!(ArgValue::Bytes(b"hello".to_vec()).to_wire(), "hello");
        assert_eq!(ArgValue::Bytes(vec![0xff, 0x00]).to_wire(), "base64:/wA=");
    }

    #[test]
    fn strip_tool_calls_keeps_prose() {
        let text = "Reading now.\n\nTOOL_CALL: read_file | path=a\nTOOL_CALL: write_file | path=b | content=```\nx\n```\n\nStill working.";
        assert_eq!(strip_tool_calls(text), "Reading now.\n\nStill working.");
    }
}
