//! Parser for the Gemini CLI.
//!
//! Same structural approach as the Claude parser with the Gemini sigils:
//! `✦` opens response text, tool invocations render inside `✔`/`✖` status
//! lines, and the input box is a `> ` prompt inside a bordered frame.

use regex::Regex;

use super::{tail_lines, ParsedResponse, Parser, Section, READY_CHECK_LINES};

/// Parser for Gemini CLI terminal output.
#[derive(Debug, Clone)]
pub struct GeminiParser {
    pub busy_markers: Vec<String>,
    pub ready_check_lines: usize,
    token_re: Regex,
}

impl Default for GeminiParser {
    fn default() -> Self {
        Self {
            busy_markers: vec!["esc to cancel".to_string(), "esc to interrupt".to_string()],
            ready_check_lines: READY_CHECK_LINES,
            token_re: Regex::new(r"(\d[\d,]*)\s+tokens").expect("token regex"),
        }
    }
}

impl GeminiParser {
    fn is_busy(&self, tail: &str) -> bool {
        let lower = tail.to_lowercase();
        self.busy_markers.iter().any(|m| lower.contains(m.as_str()))
    }

    fn is_prompt_marker(&self, line: &str) -> bool {
        let trimmed = line.trim();
        trimmed == ">" || trimmed.starts_with("│ >") || trimmed.starts_with("╰")
    }

    fn is_chrome(&self, line: &str) -> bool {
        let trimmed = line.trim();
        trimmed
            .chars()
            .next()
            .is_some_and(|c| matches!(c, '╭' | '│' | '╰' | '─' | '━'))
            || trimmed == ">"
    }
}

impl Parser for GeminiParser {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn is_ready(&self, window: &str) -> bool {
        if window.trim().is_empty() {
            return false;
        }
        let tail = tail_lines(window, self.ready_check_lines);
        if self.is_busy(&tail) {
            return false;
        }
        tail.lines().any(|line| self.is_prompt_marker(line))
    }

    fn parse(&self, window: &str) -> ParsedResponse {
        let is_ready = self.is_ready(window);

        let mut sections = Vec::new();
        let mut raw_lines: Vec<&str> = Vec::new();
        let mut current: Vec<String> = Vec::new();

        for line in window.lines() {
            if self.is_chrome(line) {
                continue;
            }
            let trimmed = line.trim_start();
            if trimmed.starts_with('✦') {
                if !current.is_empty() {
                    sections.push(Section::text(current.join("\n").trim().to_string()));
                    current.clear();
                }
                current.push(trimmed.trim_start_matches('✦').trim().to_string());
                raw_lines.push(line);
            } else if !current.is_empty() {
                if trimmed.is_empty() {
                    sections.push(Section::text(current.join("\n").trim().to_string()));
                    current.clear();
                } else {
                    current.push(line.trim().to_string());
                    raw_lines.push(line);
                }
            }
        }
        if !current.is_empty() {
            sections.push(Section::text(current.join("\n").trim().to_string()));
        }
        sections.retain(|s| !s.content.is_empty());

        let tokens = self
            .token_re
            .captures_iter(window)
            .last()
            .and_then(|caps| caps[1].replace(',', "").parse().ok());

        ParsedResponse {
            raw: raw_lines
                .iter()
                .map(|l| l.trim())
                .collect::<Vec<_>>()
                .join("\n"),
            sections,
            tokens,
            is_complete: is_ready,
            is_ready,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_is_not_ready() {
        let parser = GeminiParser::default();
        assert!(!parser.is_ready(""));
    }

    #[test]
    fn busy_marker_blocks_ready() {
        let parser = GeminiParser::default();
        let window = "✦ Working on it...\n  (esc to cancel)\n";
        assert!(!parser.is_ready(window));
    }

    #[test]
    fn prompt_frame_is_ready() {
        let parser = GeminiParser::default();
        let window = "✦ The answer is 4.\n\n╭──────────╮\n│ >        │\n╰──────────╯\n";
        assert!(parser.is_ready(window));
    }

    #[test]
    fn extracts_response_text() {
        let parser = GeminiParser::default();
        let window =
            "✦ Here is the result.\n  It spans two lines.\n\n╭────╮\n│ >  │\n╰────╯\n  1,234 tokens\n";
        let response = parser.parse(window);

        assert_eq!(response.sections.len(), 1);
        assert!(response.sections[0].content.contains("Here is the result."));
        assert!(response.sections[0].content.contains("spans two lines"));
        assert_eq!(response.tokens, Some(1234));
        assert!(response.is_ready);
    }
}
