//! Readiness and response parsers for interactive AI CLIs.
//!
//! A parser is a pure function pair over a text window (typically the tail
//! of a terminal buffer since the last input was sent):
//!
//! - [`Parser::is_ready`] decides whether the CLI has finished producing a
//!   response. The check is structural - it looks for in-progress markers
//!   and prompt markers rather than relying on timeouts, so arbitrarily long
//!   generations never falsely report ready.
//! - [`Parser::parse`] cuts the finished window into structured sections
//!   (thinking / text / tool_call) and extracts the token count from the
//!   status line.
//!
//! Parsers are selected *per call*, not per node: the same terminal can host
//! successive programs that speak different dialects.

mod claude;
mod gemini;

pub use claude::ClaudeParser;
pub use gemini::GeminiParser;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of trailing lines inspected for in-progress markers.
pub const READY_CHECK_LINES: usize = 50;

/// Which parser dialect to apply to a terminal window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserKind {
    /// Always ready; no section extraction.
    #[default]
    None,
    /// Claude Code CLI dialect.
    Claude,
    /// Gemini CLI dialect.
    Gemini,
}

impl ParserKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParserKind::None => "none",
            ParserKind::Claude => "claude",
            ParserKind::Gemini => "gemini",
        }
    }
}

impl fmt::Display for ParserKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParserKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(ParserKind::None),
            "claude" => Ok(ParserKind::Claude),
            "gemini" => Ok(ParserKind::Gemini),
            other => Err(format!("unknown parser: {other}")),
        }
    }
}

/// Kind of a parsed response section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Thinking,
    Text,
    ToolCall,
}

/// One structural section of a CLI response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    #[serde(rename = "type")]
    pub kind: SectionKind,
    pub content: String,
    /// Tool name for `tool_call` sections.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Free-form extras (e.g. raw tool arguments under `args`).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Section {
    pub fn thinking(content: impl Into<String>) -> Self {
        Self {
            kind: SectionKind::Thinking,
            content: content.into(),
            tool: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: SectionKind::Text,
            content: content.into(),
            tool: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn tool_call(tool: impl Into<String>, args: impl Into<String>, content: impl Into<String>) -> Self {
        let mut metadata = serde_json::Map::new();
        metadata.insert("args".to_string(), serde_json::Value::String(args.into()));
        Self {
            kind: SectionKind::ToolCall,
            content: content.into(),
            tool: Some(tool.into()),
            metadata,
        }
    }
}

/// Structured result of parsing a response window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedResponse {
    /// Response text with prompt echo and UI chrome stripped.
    pub raw: String,
    /// Ordered sections cut from `raw`.
    pub sections: Vec<Section>,
    /// Token count from the status line, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    /// Whether the response appears fully emitted.
    pub is_complete: bool,
    /// Whether the CLI is ready for new input.
    pub is_ready: bool,
}

/// A readiness/section parser for one CLI dialect.
///
/// Implementations must be pure: `is_ready` and `parse` read only the window
/// they are given and keep no state between calls.
pub trait Parser: Send + Sync {
    /// Parser name as recorded in history entries.
    fn name(&self) -> &'static str;

    /// Whether the CLI behind this window is ready for new input.
    fn is_ready(&self, window: &str) -> bool;

    /// Cut a window into structured sections.
    fn parse(&self, window: &str) -> ParsedResponse;
}

/// Trivial parser: always ready, no section extraction.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoneParser;

impl Parser for NoneParser {
    fn name(&self) -> &'static str {
        "none"
    }

    fn is_ready(&self, _window: &str) -> bool {
        true
    }

    fn parse(&self, window: &str) -> ParsedResponse {
        ParsedResponse {
            raw: window.to_string(),
            sections: Vec::new(),
            tokens: None,
            is_complete: true,
            is_ready: true,
        }
    }
}

/// Build the parser for a dialect.
pub fn get_parser(kind: ParserKind) -> Box<dyn Parser> {
    match kind {
        ParserKind::None => Box::new(NoneParser),
        ParserKind::Claude => Box::new(ClaudeParser::default()),
        ParserKind::Gemini => Box::new(GeminiParser::default()),
    }
}

/// Last `n` lines of a window, rejoined.
pub(crate) fn tail_lines(window: &str, n: usize) -> String {
    let lines: Vec<&str> = window.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parser_kind_round_trip() {
        for kind in [ParserKind::None, ParserKind::Claude, ParserKind::Gemini] {
            let parsed: ParserKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert!("mystery".parse::<ParserKind>().is_err());
    }

    #[test]
    fn none_parser_is_always_ready() {
        let parser = NoneParser;
        assert!(parser.is_ready(""));
        assert!(parser.is_ready("anything at all"));

        let response = parser.parse("hello\nworld");
        assert_eq!(response.raw, "hello\nworld");
        assert!(response.sections.is_empty());
        assert!(response.is_ready);
    }

    #[test]
    fn section_serializes_with_type_field() {
        let section = Section::tool_call("Read", "file=\"a.rs\"", "contents");
        let value = serde_json::to_value(&section).unwrap();
        assert_eq!(value["type"], "tool_call");
        assert_eq!(value["tool"], "Read");
        assert_eq!(value["metadata"]["args"], "file=\"a.rs\"");
    }

    #[test]
    fn tail_lines_keeps_suffix() {
        let window = (1..=10).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        assert_eq!(tail_lines(&window, 3), "8\n9\n10");
        assert_eq!(tail_lines(&window, 50), window);
    }
}
