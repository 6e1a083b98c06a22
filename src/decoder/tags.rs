//! Out-of-band placeholder protocol.
//!
//! JSON requires escaping, which is hostile to large free-form text (shell
//! scripts, multi-line documents). This protocol lets a JSON value be a
//! placeholder whose real content travels after the JSON block, verbatim,
//! between marker lines:
//!
//! ```text
//! placeholder forms (any JSON value position):
//!   "__aitag_json__:<TAG>"
//!   { "__aitag_json__": "<TAG>" }
//!   "{{__aitag__<key>}}"          (embedded in a string)
//! out-of-band block (after the JSON, any number of times):
//!   <|<TAG>_<nonce>|>
//!   <verbatim bytes, exact whitespace/escapes preserved>
//!   <|<TAG>_END_<nonce>|>
//! ```
//!
//! The nonce is supplied per decode invocation; for backward compatibility a
//! tag name may carry the nonce itself, in which case the bare markers
//! `<|<TAG>|>` … `<|<TAG>_END|>` are accepted. An unterminated block at
//! stream end is dropped silently.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeSet;

/// Key of the object placeholder form.
pub const PLACEHOLDER_KEY: &str = "__aitag_json__";
/// Prefix of the string placeholder form.
pub const PLACEHOLDER_PREFIX: &str = "__aitag_json__:";

/// Embedded placeholder: `{{__aitag__<key>}}` inside a string.
static EMBED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{__aitag__([A-Za-z0-9_.\-]+)\}\}").expect("embed regex"));

/// The tag referenced by a value, if the value *is* a placeholder
/// (string-prefix or single-key-object form).
fn direct_tag(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => s.strip_prefix(PLACEHOLDER_PREFIX),
        Value::Object(map) if map.len() == 1 => match map.get(PLACEHOLDER_KEY) {
            Some(Value::String(tag)) => Some(tag.as_str()),
            _ => None,
        },
        _ => None,
    }
}

/// Collect every tag referenced anywhere inside `value`, at any depth.
pub fn collect_tags(value: &Value, out: &mut BTreeSet<String>) {
    if let Some(tag) = direct_tag(value) {
        out.insert(tag.to_string());
        return;
    }
    match value {
        Value::String(s) => {
            for caps in EMBED_RE.captures_iter(s) {
                out.insert(caps[1].to_string());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_tags(item, out);
            }
        }
        Value::Object(map) => {
            for item in map.values() {
                collect_tags(item, out);
            }
        }
        _ => {}
    }
}

/// Tags referenced inside `value`, as a fresh set.
pub fn tags_of(value: &Value) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_tags(value, &mut out);
    out
}

/// Substitute the resolved content of `tag` everywhere inside `value`.
///
/// Placeholder values (string-prefix and object forms) are replaced with the
/// content parsed as JSON when it parses, and with the raw string otherwise.
/// The embedded form splices the raw bytes into the containing string.
pub fn substitute(value: &mut Value, tag: &str, content: &str) {
    if direct_tag(value) == Some(tag) {
        *value = parse_or_string(content);
        return;
    }
    match value {
        Value::String(s) => {
            let needle = format!("{{{{__aitag__{}}}}}", tag);
            if s.contains(&needle) {
                *value = Value::String(s.replace(&needle, content));
            }
        }
        Value::Array(items) => {
            for item in items {
                substitute(item, tag, content);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                substitute(item, tag, content);
            }
        }
        _ => {}
    }
}

/// Parse content as JSON where possible, else carry it as a string verbatim.
fn parse_or_string(content: &str) -> Value {
    serde_json::from_str(content).unwrap_or_else(|_| Value::String(content.to_string()))
}

// ----------------------------------------------------------------------------
// Marker block scanner
// ----------------------------------------------------------------------------

struct OpenBlock {
    /// Tag name with any nonce suffix stripped
    tag: String,
    /// Acceptable end markers for this block
    end_markers: Vec<String>,
    /// Byte offset in the scanner buffer where content starts
    content_start: usize,
}

/// Scans the raw stream for out-of-band marker blocks, independent of JSON
/// structure. Fed the same chunks as the JSON scanner; emits `(tag, content)`
/// for every complete block, with content preserved byte-for-byte.
pub struct TagScanner {
    nonce: String,
    buf: String,
    open: Option<OpenBlock>,
}

impl TagScanner {
    /// Create a scanner for one decode invocation's nonce.
    pub fn new(nonce: &str) -> Self {
        Self {
            nonce: nonce.to_string(),
            buf: String::new(),
            open: None,
        }
    }

    /// Feed one chunk; `on_block` fires once per completed block.
    pub fn feed(&mut self, chunk: &str, mut on_block: impl FnMut(&str, &str)) {
        self.buf.push_str(chunk);
        loop {
            match &self.open {
                None => {
                    // Look for a complete open marker `<|NAME|>`.
                    let Some(start) = self.buf.find("<|") else {
                        // A trailing '<' may be half of a split "<|".
                        if self.buf.ends_with('<') {
                            let keep = self.buf.len() - 1;
                            self.buf.drain(..keep);
                        } else {
                            self.buf.clear();
                        }
                        return;
                    };
                    let Some(rel_end) = self.buf[start..].find("|>") else {
                        // Partial marker: keep the tail, wait for more input.
                        self.buf.drain(..start);
                        return;
                    };
                    let name = self.buf[start + 2..start + rel_end].to_string();
                    let content_start = start + rel_end + 2;
                    if name.is_empty() || name.contains('\n') {
                        // Not a marker; skip past the false open.
                        self.buf.drain(..start + 2);
                        continue;
                    }
                    let (tag, end_markers) = self.classify(&name);
                    self.buf.drain(..content_start);
                    self.open = Some(OpenBlock {
                        tag,
                        end_markers,
                        content_start: 0,
                    });
                }
                Some(block) => {
                    let found = block
                        .end_markers
                        .iter()
                        .filter_map(|marker| {
                            self.buf[block.content_start..]
                                .find(marker.as_str())
                                .map(|at| (block.content_start + at, marker.len()))
                        })
                        .min();
                    let Some((at, marker_len)) = found else {
                        return;
                    };
                    let content = self.buf[block.content_start..at].to_string();
                    let tag = block.tag.clone();
                    self.buf.drain(..at + marker_len);
                    self.open = None;
                    on_block(&tag, &content);
                }
            }
        }
    }

    /// End of stream: an unterminated block is dropped silently.
    pub fn finish(&mut self) {
        self.open = None;
        self.buf.clear();
    }

    /// Resolve a marker name to its tag and the end markers that close it.
    fn classify(&self, name: &str) -> (String, Vec<String>) {
        let suffix = format!("_{}", self.nonce);
        if !self.nonce.is_empty() {
            if let Some(base) = name.strip_suffix(&suffix) {
                return (
                    base.to_string(),
                    vec![
                        format!("<|{}_END_{}|>", base, self.nonce),
                        format!("<|{}_END|>", name),
                    ],
                );
            }
        }
        // Compatibility: the tag name already embeds the nonce (or none is
        // in use); the bare END form closes it.
        (
            name.to_string(),
            vec![
                format!("<|{}_END|>", name),
                format!("<|{}_END_{}|>", name, self.nonce),
            ],
        )
    }
}
