use serde::Serialize;
use serde_json::Value;

use crate::parser::{Block, LogEntry, Role};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionMetadata {
    pub id: Option<String>,
    pub timestamp: Option<String>,
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThinkingEntry {
    pub timestamp: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRecord {
    pub timestamp: Option<String>,
    pub name: String,
    pub arguments: Value,
    pub result: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageRecord {
    pub role: Role,
    pub timestamp: Option<String>,
    pub text: String,
}

/// Order-preserving summary of one session log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub metadata: Option<SessionMetadata>,
    pub thinking: Vec<ThinkingEntry>,
    pub tool_calls: Vec<ToolCallRecord>,
    pub messages: Vec<MessageRecord>,
    pub final_output: Option<String>,
}

impl Transcript {
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = LogEntry>,
    {
        let mut builder = TranscriptBuilder::new();
        for entry in entries {
            builder.push(entry);
        }
        builder.finish()
    }

    /// Session id from the log's session record, if it carried one.
    pub fn session_id(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.id.as_deref())
    }

    pub fn started_at(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(|m| m.timestamp.as_deref())
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_none()
            && self.thinking.is_empty()
            && self.tool_calls.is_empty()
            && self.messages.is_empty()
    }
}

/// Folds log entries, in order, into a [`Transcript`].
#[derive(Debug, Default)]
pub struct TranscriptBuilder {
    transcript: Transcript,
    orphan_results: usize,
}

impl TranscriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: LogEntry) {
        match entry {
            LogEntry::SessionMeta { id, timestamp, cwd } => {
                if self.transcript.metadata.is_none() {
                    self.transcript.metadata = Some(SessionMetadata { id, timestamp, cwd });
                }
            }
            LogEntry::Message {
                role,
                timestamp,
                blocks,
            } => self.push_blocks(role, timestamp, blocks),
            LogEntry::ToolResult { content, .. } => self.attach_result(content),
        }
    }

    fn push_blocks(&mut self, role: Role, timestamp: Option<String>, blocks: Vec<Block>) {
        let t = &mut self.transcript;
        for block in blocks {
            match block {
                Block::Thinking { text } => t.thinking.push(ThinkingEntry {
                    timestamp: timestamp.clone(),
                    text,
                }),
                Block::Text { text } => {
                    if role == Role::Assistant {
                        t.final_output = Some(text.clone());
                    }
                    t.messages.push(MessageRecord {
                        role: role.clone(),
                        timestamp: timestamp.clone(),
                        text,
                    });
                }
                Block::ToolCall { name, arguments } => t.tool_calls.push(ToolCallRecord {
                    timestamp: timestamp.clone(),
                    name,
                    arguments,
                    result: None,
                }),
                Block::Ignored { .. } => {}
            }
        }
    }

    /// Attach to the most recent tool call that has no result yet.
    fn attach_result(&mut self, content: String) {
        let calls = &mut self.transcript.tool_calls;
        match calls.iter().rposition(|c| c.result.is_none()) {
            Some(idx) => calls[idx].result = Some(content),
            None => {
                self.orphan_results += 1;
                tracing::debug!("discarding tool result with no pending tool call");
            }
        }
    }

    /// Number of tool results discarded because no call was waiting for one.
    pub fn orphan_results(&self) -> usize {
        self.orphan_results
    }

    pub fn finish(self) -> Transcript {
        self.transcript
    }
}
