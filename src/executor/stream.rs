use serde::Deserialize;
use serde_json::Value;

/// Events from the Claude CLI's stream-json output format
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "user")]
    User {},

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },

    #[serde(rename = "system")]
    System {},
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse { name: String, input: Value },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

/// Accumulates a stream-json session into plain text.
///
/// Lines that are not stream-json events are kept verbatim, so plain-text
/// executors produce a usable transcript too.
#[derive(Debug, Default)]
pub struct Transcript {
    text: String,
    final_result: Option<String>,
    pub is_error: bool,
    pub tool_uses: usize,
}

impl Transcript {
    /// Fold one stdout line. Returns a short activity description for
    /// tool invocations.
    pub fn push_line(&mut self, line: &str) -> Option<String> {
        if line.trim().is_empty() {
            return None;
        }
        match serde_json::from_str::<StreamEvent>(line) {
            Ok(StreamEvent::Assistant { message }) => {
                let mut activity = None;
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            self.text.push_str(&text);
                            self.text.push('\n');
                        }
                        ContentBlock::ToolUse { name, input } => {
                            self.tool_uses += 1;
                            activity = Some(describe_tool_use(&name, &input));
                        }
                        ContentBlock::Other => {}
                    }
                }
                activity
            }
            Ok(StreamEvent::Result { result, is_error }) => {
                self.final_result = result;
                self.is_error = is_error;
                None
            }
            Ok(StreamEvent::User {} | StreamEvent::System {}) => None,
            Err(_) => {
                self.text.push_str(line);
                self.text.push('\n');
                None
            }
        }
    }

    /// Assistant text followed by the final result, so a token emitted in
    /// either place is visible to the scanner.
    pub fn into_text(self) -> String {
        match self.final_result {
            Some(result) if !self.text.contains(&result) => {
                format!("{}{}\n", self.text, result)
            }
            _ => self.text,
        }
    }
}

/// Extract a human-readable description from a tool use event
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| input.get(key).and_then(|v| v.as_str());
    match name {
        "Read" => format!("Reading: {}", field("file_path").map(shorten_path).unwrap_or_default()),
        "Write" => format!("Writing: {}", field("file_path").map(shorten_path).unwrap_or_default()),
        "Bash" => format!(
            "Running: {}",
            truncate_str(field("command").unwrap_or("command"), 40)
        ),
        "WebFetch" => format!("Fetching: {}", truncate_str(field("url").unwrap_or("url"), 50)),
        _ => name.to_string(),
    }
}

/// Shorten a file path to just the last 2 components
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

fn truncate_str(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
