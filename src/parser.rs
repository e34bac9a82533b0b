use std::fmt;
use std::io::BufRead;

use serde::Serialize;
use serde_json::Value;

/// Speaker of a `message` record. `toolResult` records never reach this type;
/// they become [`LogEntry::ToolResult`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    Other(String),
}

impl Role {
    fn from_wire(s: &str) -> Self {
        match s {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => Role::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Other(name) => write!(f, "{name}"),
        }
    }
}

impl Serialize for Role {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// One typed fragment of a message's `content` array.
#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Thinking { text: String },
    Text { text: String },
    ToolCall { name: String, arguments: Value },
    /// A block whose `type` tag is not one of the above.
    Ignored { tag: String },
}

/// One decoded record from a session log.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    SessionMeta {
        id: Option<String>,
        timestamp: Option<String>,
        cwd: Option<String>,
    },
    Message {
        role: Role,
        timestamp: Option<String>,
        blocks: Vec<Block>,
    },
    ToolResult {
        timestamp: Option<String>,
        content: String,
    },
}

/// Counters describing what the parser skipped along the way.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ParseStats {
    pub lines_read: usize,
    pub blank: usize,
    pub malformed: usize,
    pub ignored_records: usize,
    pub ignored_blocks: usize,
}

/// Forward-only reader turning raw log lines into [`LogEntry`] values.
///
/// Lines that are not valid JSON, or not valid UTF-8, are skipped. An I/O
/// error ends the stream. The parser is consumed by iteration; re-open the
/// source to read it again.
pub struct LogStreamParser<R> {
    reader: R,
    buf: Vec<u8>,
    stats: ParseStats,
    done: bool,
}

impl<R: BufRead> LogStreamParser<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            stats: ParseStats::default(),
            done: false,
        }
    }

    pub fn stats(&self) -> ParseStats {
        self.stats
    }

    /// Fill `buf` with the next raw line. Returns false at end of input.
    fn fill_line(&mut self) -> bool {
        if self.done {
            return false;
        }
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => {
                self.done = true;
                false
            }
            Ok(_) => {
                self.stats.lines_read += 1;
                true
            }
            Err(e) => {
                tracing::warn!("session log read failed, stopping: {e}");
                self.done = true;
                false
            }
        }
    }
}

impl<R: BufRead> Iterator for LogStreamParser<R> {
    type Item = LogEntry;

    fn next(&mut self) -> Option<LogEntry> {
        loop {
            if !self.fill_line() {
                return None;
            }
            let line_no = self.stats.lines_read;

            let Ok(text) = std::str::from_utf8(&self.buf) else {
                tracing::debug!(line = line_no, "skipping line with invalid UTF-8");
                self.stats.malformed += 1;
                continue;
            };
            let text = text.trim();
            if text.is_empty() {
                self.stats.blank += 1;
                continue;
            }

            let v: Value = match serde_json::from_str(text) {
                Ok(v) => v,
                Err(e) => {
                    tracing::debug!(line = line_no, "skipping malformed line: {e}");
                    self.stats.malformed += 1;
                    continue;
                }
            };

            match decode_record(&v) {
                Some(entry) => {
                    self.stats.ignored_blocks += count_ignored(&entry);
                    return Some(entry);
                }
                None => self.stats.ignored_records += 1,
            }
        }
    }
}

/// Decode a single raw line. Returns `None` for malformed or ignored records.
pub fn parse_line(line: &str) -> Option<LogEntry> {
    let v: Value = serde_json::from_str(line.trim()).ok()?;
    decode_record(&v)
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(|s| s.as_str()).map(str::to_string)
}

fn decode_record(v: &Value) -> Option<LogEntry> {
    match v.get("type").and_then(|t| t.as_str())? {
        "session" => Some(LogEntry::SessionMeta {
            id: str_field(v, "id"),
            timestamp: str_field(v, "timestamp"),
            cwd: str_field(v, "cwd"),
        }),
        "message" => decode_message(v),
        _ => None,
    }
}

fn decode_message(v: &Value) -> Option<LogEntry> {
    let msg = v.get("message")?;
    let timestamp = str_field(v, "timestamp");
    let role = msg.get("role").and_then(|r| r.as_str()).unwrap_or_default();
    let content = msg.get("content");

    if role == "toolResult" {
        let content = match content? {
            Value::String(s) => s.clone(),
            Value::Array(parts) => parts
                .iter()
                .map(|p| p.get("text").and_then(|t| t.as_str()).unwrap_or_default())
                .collect::<Vec<_>>()
                .join("\n"),
            Value::Null => return None,
            other => other.to_string(),
        };
        return Some(LogEntry::ToolResult { timestamp, content });
    }

    let blocks = content
        .and_then(|c| c.as_array())
        .map(|items| items.iter().filter_map(decode_block).collect())
        .unwrap_or_default();

    Some(LogEntry::Message {
        role: Role::from_wire(role),
        timestamp,
        blocks,
    })
}

fn decode_block(block: &Value) -> Option<Block> {
    let tag = block.get("type").and_then(|t| t.as_str()).unwrap_or_default();
    match tag {
        "thinking" => non_empty(block, "thinking").map(|text| Block::Thinking { text }),
        "text" => non_empty(block, "text").map(|text| Block::Text { text }),
        "toolCall" => Some(Block::ToolCall {
            name: str_field(block, "name").unwrap_or_default(),
            arguments: block.get("arguments").cloned().unwrap_or(Value::Null),
        }),
        _ => Some(Block::Ignored {
            tag: tag.to_string(),
        }),
    }
}

fn non_empty(block: &Value, key: &str) -> Option<String> {
    str_field(block, key).filter(|s| !s.is_empty())
}

fn count_ignored(entry: &LogEntry) -> usize {
    match entry {
        LogEntry::Message { blocks, .. } => blocks
            .iter()
            .filter(|b| matches!(b, Block::Ignored { .. }))
            .count(),
        _ => 0,
    }
}
