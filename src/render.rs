use std::borrow::Cow;

use crate::transcript::Transcript;

pub const TRUNCATION_MARKER: &str = "...[truncated]";
pub const DEFAULT_ARGS_BUDGET: usize = 200;
pub const DEFAULT_RESULT_BUDGET: usize = 2000;

const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub agent_id: String,
    pub task: Option<String>,
    pub include_messages: bool,
    pub args_budget: usize,
    pub result_budget: usize,
}

impl RenderOptions {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            task: None,
            include_messages: true,
            args_budget: DEFAULT_ARGS_BUDGET,
            result_budget: DEFAULT_RESULT_BUDGET,
        }
    }
}

/// Render a transcript as markdown.
///
/// The output depends only on `transcript` and `opts`; equal inputs always give
/// byte-identical text, which is what the integrity manifest hashes.
pub fn render_markdown(transcript: &Transcript, opts: &RenderOptions) -> String {
    let mut md = String::new();

    md.push_str(&format!("# Subagent Transcript: {}\n\n", opts.agent_id));
    md.push_str(&format!(
        "**Session ID:** {}\n",
        transcript.session_id().unwrap_or(UNKNOWN)
    ));
    md.push_str(&format!(
        "**Started:** {}\n",
        transcript.started_at().unwrap_or(UNKNOWN)
    ));
    if let Some(task) = &opts.task {
        md.push_str(&format!("**Task:** {task}\n"));
    }
    md.push_str("\n---\n\n");

    if !transcript.thinking.is_empty() {
        md.push_str("## Reasoning (Thinking Blocks)\n\n");
        for entry in &transcript.thinking {
            md.push_str(&format!("### {}\n", ts(&entry.timestamp)));
            md.push_str(&entry.text);
            md.push_str("\n\n");
        }
        md.push_str("---\n\n");
    }

    if !transcript.tool_calls.is_empty() {
        md.push_str("## Tool Calls\n\n");
        for call in &transcript.tool_calls {
            md.push_str(&format!("### {} ({})\n", call.name, ts(&call.timestamp)));
            let args = call.arguments.to_string();
            md.push_str(&format!(
                "**Arguments:** {}\n",
                inline_code(&truncate_bytes(&args, opts.args_budget))
            ));
            if let Some(result) = &call.result {
                let preview = truncate_bytes(result, opts.result_budget);
                let fence = fence_for(&preview);
                md.push_str(&format!("**Result:**\n{fence}\n{preview}\n{fence}\n"));
            }
            md.push('\n');
        }
        md.push_str("---\n\n");
    }

    if opts.include_messages && !transcript.messages.is_empty() {
        md.push_str("## Messages\n\n");
        for msg in &transcript.messages {
            md.push_str(&format!("**[{}]** {}\n", msg.role, ts(&msg.timestamp)));
            md.push_str(&msg.text);
            md.push_str("\n\n");
        }
        md.push_str("---\n\n");
    }

    if let Some(output) = &transcript.final_output {
        md.push_str("## Final Output\n\n");
        md.push_str(output);
        md.push('\n');
    }

    md
}

fn ts(timestamp: &Option<String>) -> &str {
    timestamp.as_deref().unwrap_or(UNKNOWN)
}

/// Cap `s` at `budget` bytes, appending [`TRUNCATION_MARKER`] when cut.
/// Never splits a UTF-8 code point.
pub fn truncate_bytes(s: &str, budget: usize) -> Cow<'_, str> {
    if s.len() <= budget {
        return Cow::Borrowed(s);
    }
    let mut end = budget;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!("{}{TRUNCATION_MARKER}", &s[..end]))
}

fn longest_backtick_run(body: &str) -> usize {
    let mut longest = 0;
    let mut run = 0;
    for c in body.chars() {
        if c == '`' {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    longest
}

/// A backtick fence longer than any backtick run inside `body`.
fn fence_for(body: &str) -> String {
    "`".repeat(longest_backtick_run(body).max(2) + 1)
}

/// `body` as an inline code span whose delimiter outgrows any backtick run
/// inside it. Content touching a backtick at either end is space-padded.
fn inline_code(body: &str) -> String {
    let delim = "`".repeat(longest_backtick_run(body) + 1);
    if body.starts_with('`') || body.ends_with('`') {
        format!("{delim} {body} {delim}")
    } else {
        format!("{delim}{body}{delim}")
    }
}
