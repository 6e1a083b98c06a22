//! Incremental structural JSON scanner.
//!
//! Consumes a text stream believed to contain one JSON object (possibly
//! preceded/followed by unrelated text, possibly malformed or truncated) and
//! emits each top-level key/value pair the moment its value completes, plus
//! the fully-formed object when the closing brace arrives.
//!
//! The scanner is deliberately tolerant: junk between pairs is skipped, a
//! value that does not parse is surfaced as a raw string, and a truncated
//! trailing pair is dropped rather than reported.

use serde_json::Value;

use super::action::JsonMap;

/// Events emitted while scanning.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A top-level key/value pair completed.
    Pair {
        /// The decoded key
        key: String,
        /// The parsed value (raw string if unparseable)
        value: Value,
    },
    /// The top-level object closed.
    ObjectDone {
        /// The complete object
        value: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    /// Skipping text until the opening brace
    SeekObject,
    /// Inside the object, before a key
    ExpectKey,
    /// Inside a key string
    InKey,
    /// Between key and ':'
    ExpectColon,
    /// Between ':' and the first value character
    ExpectValue,
    /// Consuming a value
    InValue,
    /// Top-level object closed; everything after is ignored
    Done,
}

/// Streaming scanner over one top-level JSON object.
pub struct JsonScanner {
    buf: String,
    pos: usize,
    state: State,
    key_start: usize,
    key_escape: bool,
    current_key: Option<String>,
    value_start: usize,
    value_depth: usize,
    in_string: bool,
    escape: bool,
    object_start: usize,
    pairs: JsonMap,
}

impl JsonScanner {
    /// Create a scanner with empty state.
    pub fn new() -> Self {
        Self {
            buf: String::new(),
            pos: 0,
            state: State::SeekObject,
            key_start: 0,
            key_escape: false,
            current_key: None,
            value_start: 0,
            value_depth: 0,
            in_string: false,
            escape: false,
            object_start: 0,
            pairs: JsonMap::new(),
        }
    }

    /// Everything fed so far, for diagnostics.
    pub fn consumed(&self) -> &str {
        &self.buf
    }

    /// Whether the top-level object has closed.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Feed one chunk, emitting any events that complete inside it.
    pub fn feed(&mut self, chunk: &str, mut on_event: impl FnMut(ScanEvent)) {
        self.buf.push_str(chunk);
        if self.state == State::Done {
            self.pos = self.buf.len();
            return;
        }

        // Indices from char_indices are byte offsets, so slicing below stays
        // on character boundaries.
        let chars: Vec<(usize, char)> = self.buf[self.pos..]
            .char_indices()
            .map(|(rel, c)| (self.pos + rel, c))
            .collect();

        for (i, c) in chars {
            match self.state {
                State::Done => break,
                State::SeekObject => {
                    if c == '{' {
                        self.object_start = i;
                        self.state = State::ExpectKey;
                    }
                }
                State::ExpectKey => {
                    if c == '"' {
                        self.key_start = i;
                        self.key_escape = false;
                        self.state = State::InKey;
                    } else if c == '}' {
                        self.finish_object(i, &mut on_event);
                    }
                    // Anything else (whitespace, commas, stray junk) skips.
                }
                State::InKey => {
                    if self.key_escape {
                        self.key_escape = false;
                    } else if c == '\\' {
                        self.key_escape = true;
                    } else if c == '"' {
                        let raw = &self.buf[self.key_start..=i];
                        self.current_key = Some(parse_json_string(raw));
                        self.state = State::ExpectColon;
                    }
                }
                State::ExpectColon => {
                    if c == ':' {
                        self.state = State::ExpectValue;
                    }
                }
                State::ExpectValue => {
                    if c.is_whitespace() {
                        continue;
                    }
                    if c == '}' {
                        // Malformed "key:}": drop the dangling key.
                        self.current_key = None;
                        self.finish_object(i, &mut on_event);
                        continue;
                    }
                    self.value_start = i;
                    self.value_depth = 0;
                    self.in_string = false;
                    self.escape = false;
                    self.state = State::InValue;
                    match c {
                        '"' => self.in_string = true,
                        '{' | '[' => self.value_depth = 1,
                        _ => {}
                    }
                }
                State::InValue => {
                    if self.in_string {
                        if self.escape {
                            self.escape = false;
                        } else if c == '\\' {
                            self.escape = true;
                        } else if c == '"' {
                            self.in_string = false;
                        }
                        continue;
                    }
                    match c {
                        '"' => self.in_string = true,
                        '{' | '[' => self.value_depth += 1,
                        ']' => {
                            self.value_depth = self.value_depth.saturating_sub(1);
                        }
                        '}' => {
                            if self.value_depth > 0 {
                                self.value_depth -= 1;
                            } else {
                                // Top-level close: the current value ends here.
                                self.emit_pair(i, &mut on_event);
                                self.finish_object(i, &mut on_event);
                            }
                        }
                        ',' => {
                            if self.value_depth == 0 {
                                self.emit_pair(i, &mut on_event);
                                self.state = State::ExpectKey;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        self.pos = self.buf.len();
    }

    /// Signal end of stream. A pair still in flight is dropped (best-effort).
    pub fn finish(&mut self) {
        if self.state != State::Done {
            self.state = State::Done;
        }
    }

    fn emit_pair(&mut self, end: usize, on_event: &mut impl FnMut(ScanEvent)) {
        let key = match self.current_key.take() {
            Some(key) => key,
            None => return,
        };
        let raw = self.buf[self.value_start..end].trim();
        if raw.is_empty() {
            return;
        }
        let value = parse_value(raw);
        self.pairs.insert(key.clone(), value.clone());
        on_event(ScanEvent::Pair { key, value });
    }

    fn finish_object(&mut self, end: usize, on_event: &mut impl FnMut(ScanEvent)) {
        self.state = State::Done;
        let raw = &self.buf[self.object_start..=end];
        // Prefer the real parse (duplicate keys, exotic escapes); fall back to
        // the pairs gathered along the way when the document is malformed.
        let value = match serde_json::from_str::<Value>(raw) {
            Ok(v @ Value::Object(_)) => v,
            _ => Value::Object(self.pairs.clone()),
        };
        on_event(ScanEvent::ObjectDone { value });
    }
}

impl Default for JsonScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a JSON string literal (with surrounding quotes), tolerating failure.
fn parse_json_string(raw: &str) -> String {
    serde_json::from_str::<String>(raw)
        .unwrap_or_else(|_| raw.trim_matches('"').to_string())
}

/// Parse a raw value slice, falling back to a plain string for junk.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.trim_matches('"').to_string()))
}
