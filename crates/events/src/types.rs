//! Message types carried by the output broker

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Marker serialized as `"status": "completed"` on the terminal message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Completed,
}

/// One message on a build stream.
///
/// Serializes to the NDJSON wire format: `{"output": "<line>"}` for streamed
/// lines and `{"status": "completed", "success": <bool>}` for the terminal message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum BuildMessage {
    /// A single line of build output
    Output { output: String },
    /// The terminal outcome, sent exactly once per session
    Completed {
        status: CompletionStatus,
        success: bool,
    },
}

impl BuildMessage {
    /// Create an output line, dropping the trailing line terminator
    pub fn output(text: impl Into<String>) -> Self {
        let mut output = text.into();
        while output.ends_with('\n') || output.ends_with('\r') {
            output.pop();
        }
        Self::Output { output }
    }

    pub fn completed(success: bool) -> Self {
        Self::Completed {
            status: CompletionStatus::Completed,
            success,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Output { output } => Some(output),
            Self::Completed { .. } => None,
        }
    }

    pub fn success(&self) -> Option<bool> {
        match self {
            Self::Completed { success, .. } => Some(*success),
            Self::Output { .. } => None,
        }
    }

    /// Encode as one NDJSON line, including the trailing newline
    pub fn to_ndjson(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_wire_format() {
        let msg = BuildMessage::output("Pulling latest changes...\n");
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"output":"Pulling latest changes..."}"#
        );
    }

    #[test]
    fn test_completed_wire_format() {
        let msg = BuildMessage::completed(true);
        assert_eq!(
            serde_json::to_string(&msg).unwrap(),
            r#"{"status":"completed","success":true}"#
        );
    }

    #[test]
    fn test_output_strips_crlf() {
        let msg = BuildMessage::output("[ 42%] Building CXX object\r\n");
        assert_eq!(msg.text(), Some("[ 42%] Building CXX object"));
    }

    #[test]
    fn test_output_keeps_inner_whitespace() {
        let msg = BuildMessage::output("  indented line  ");
        assert_eq!(msg.text(), Some("  indented line  "));
    }

    #[test]
    fn test_parse_terminal_line() {
        let msg: BuildMessage =
            serde_json::from_str(r#"{"status":"completed","success":false}"#).unwrap();
        assert!(msg.is_terminal());
        assert_eq!(msg.success(), Some(false));
    }

    #[test]
    fn test_ndjson_has_single_newline() {
        let line = BuildMessage::output("hello").to_ndjson().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }
}
