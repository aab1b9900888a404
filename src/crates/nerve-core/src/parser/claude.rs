//! Parser for the Claude Code CLI.
//!
//! Claude renders responses with fixed sigils: `∴ Thinking…` opens a
//! thinking block, `⏺ Tool(args)` with a `⎿ result` continuation forms a
//! tool call, and remaining prose is the answer text. The input box renders
//! as a bare `>` prompt line between dividers with a `-- INSERT --` status
//! line carrying the context token count.

use regex::Regex;

use super::{tail_lines, ParsedResponse, Parser, Section, READY_CHECK_LINES};

/// Parser for Claude Code terminal output.
///
/// Marker strings are fields rather than constants: point releases of the
/// CLI have shifted wording, and the exact text is tolerated as
/// configuration with the documented defaults.
#[derive(Debug, Clone)]
pub struct ClaudeParser {
    /// Case-insensitive markers that indicate a response is still streaming.
    pub busy_markers: Vec<String>,
    /// Marker inserted when the CLI compacts the conversation; the response
    /// is taken from after the last occurrence.
    pub compaction_marker: String,
    /// Trailing hint distinguishing a suggestion completion from the user
    /// prompt echo.
    pub suggestion_hint: String,
    /// How many trailing lines to scan for busy markers.
    pub ready_check_lines: usize,
    token_re: Regex,
    tool_re: Regex,
}

impl Default for ClaudeParser {
    fn default() -> Self {
        Self {
            busy_markers: vec!["esc to interrupt".to_string(), "esc to cancel".to_string()],
            compaction_marker: "Conversation compacted".to_string(),
            suggestion_hint: "(tab to accept)".to_string(),
            ready_check_lines: READY_CHECK_LINES,
            token_re: Regex::new(r"(\d[\d,]*)\s+tokens").expect("token regex"),
            tool_re: Regex::new(r"^⏺\s*([A-Za-z_][A-Za-z0-9_-]*)\((.*)\)\s*$").expect("tool regex"),
        }
    }
}

impl ClaudeParser {
    fn is_busy(&self, tail: &str) -> bool {
        let lower = tail.to_lowercase();
        self.busy_markers.iter().any(|m| lower.contains(m.as_str()))
    }

    /// A line that renders the (empty) input prompt or the editor status.
    fn is_prompt_marker(&self, line: &str) -> bool {
        let trimmed = line.trim();
        trimmed == ">" || trimmed == "❯" || line.contains("-- INSERT --")
    }

    /// A user prompt echo: `> some question` at the start of a line, which
    /// is not a suggestion completion (those carry a trailing hint).
    fn is_user_prompt_echo(&self, line: &str) -> bool {
        let trimmed = line.trim_start();
        trimmed.starts_with("> ")
            && trimmed.len() > 2
            && !trimmed.trim_end().ends_with(self.suggestion_hint.as_str())
    }

    /// UI chrome that never belongs to the response body.
    fn is_chrome(&self, line: &str) -> bool {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return false;
        }
        if trimmed.chars().all(|c| matches!(c, '─' | '━' | '═' | '╌')) {
            return true;
        }
        if line.contains("-- INSERT --") {
            return true;
        }
        if self.is_prompt_marker(line) {
            return true;
        }
        // Suggestion completions below the divider.
        trimmed.starts_with('>') && trimmed.trim_end().ends_with(self.suggestion_hint.as_str())
    }

    /// Extract the response body: everything after the last user prompt echo
    /// (or the last compaction marker, whichever comes later), minus chrome.
    fn response_lines<'a>(&self, window: &'a str) -> Vec<&'a str> {
        let lines: Vec<&str> = window.lines().collect();

        let mut start = 0;
        for (i, line) in lines.iter().enumerate() {
            if self.is_user_prompt_echo(line) || line.contains(self.compaction_marker.as_str()) {
                start = i + 1;
            }
        }

        lines[start..]
            .iter()
            .filter(|line| !self.is_chrome(line))
            .copied()
            .collect()
    }

    fn extract_tokens(&self, window: &str) -> Option<u64> {
        self.token_re
            .captures_iter(window)
            .last()
            .and_then(|caps| caps[1].replace(',', "").parse().ok())
    }

    fn extract_sections(&self, lines: &[&str]) -> Vec<Section> {
        let mut sections = Vec::new();
        let mut text_buf: Vec<String> = Vec::new();
        let mut i = 0;

        let flush_text = |buf: &mut Vec<String>, sections: &mut Vec<Section>| {
            let content = buf.join("\n").trim().to_string();
            if !content.is_empty() {
                sections.push(Section::text(content));
            }
            buf.clear();
        };

        while i < lines.len() {
            let line = lines[i];
            let trimmed = line.trim_start();

            if trimmed.starts_with('∴') {
                flush_text(&mut text_buf, &mut sections);
                let mut body = Vec::new();
                i += 1;
                while i < lines.len() {
                    let next = lines[i].trim_start();
                    if next.starts_with('∴') || next.starts_with('⏺') {
                        break;
                    }
                    body.push(lines[i].trim().to_string());
                    i += 1;
                }
                while body.last().is_some_and(|l| l.is_empty()) {
                    body.pop();
                }
                sections.push(Section::thinking(body.join("\n")));
                continue;
            }

            if trimmed.starts_with('⏺') {
                flush_text(&mut text_buf, &mut sections);
                if let Some(caps) = self.tool_re.captures(trimmed) {
                    // Tool call: gather the ⎿ continuation block as content.
                    let tool = caps[1].to_string();
                    let args = caps[2].to_string();
                    let mut result = Vec::new();
                    i += 1;
                    while i < lines.len() {
                        let next = lines[i];
                        let next_trimmed = next.trim_start();
                        if next_trimmed.starts_with('⎿') {
                            result.push(next_trimmed.trim_start_matches('⎿').trim().to_string());
                        } else if next.starts_with("  ") && !next_trimmed.is_empty() {
                            result.push(next.trim().to_string());
                        } else {
                            break;
                        }
                        i += 1;
                    }
                    sections.push(Section::tool_call(tool, args, result.join("\n")));
                } else {
                    // Prose sigil: response text.
                    let mut body = vec![trimmed.trim_start_matches('⏺').trim().to_string()];
                    i += 1;
                    while i < lines.len() {
                        let next = lines[i];
                        let next_trimmed = next.trim_start();
                        if next_trimmed.is_empty()
                            || next_trimmed.starts_with('∴')
                            || next_trimmed.starts_with('⏺')
                            || next_trimmed.starts_with('⎿')
                        {
                            break;
                        }
                        body.push(next.trim().to_string());
                        i += 1;
                    }
                    sections.push(Section::text(body.join("\n")));
                }
                continue;
            }

            if trimmed.is_empty() {
                flush_text(&mut text_buf, &mut sections);
            } else {
                text_buf.push(line.trim().to_string());
            }
            i += 1;
        }

        flush_text(&mut text_buf, &mut sections);
        sections
    }
}

impl Parser for ClaudeParser {
    fn name(&self) -> &'static str {
        "claude"
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
        let lines = self.response_lines(window);
        let raw = lines.join("\n").trim().to_string();
        let sections = self.extract_sections(&lines);
        let tokens = self.extract_tokens(window);

        ParsedResponse {
            raw,
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
    use crate::parser::SectionKind;

    const DIVIDER: &str =
        "───────────────────────────────────────────────────────────";

    fn ready_window(body: &str, tokens: u64) -> String {
        format!("> Question\n\n{body}\n\n{DIVIDER}\n>\n{DIVIDER}\n  -- INSERT --                                    {tokens} tokens\n")
    }

    #[test]
    fn empty_window_is_not_ready() {
        let parser = ClaudeParser::default();
        assert!(!parser.is_ready(""));
        assert!(!parser.is_ready("   \n  "));

        let response = parser.parse("");
        assert_eq!(response.raw, "");
        assert!(response.sections.is_empty());
    }

    #[test]
    fn busy_marker_blocks_ready() {
        let parser = ClaudeParser::default();
        let window = "> Some prompt\n∴ Thinking…\n  Still working on this...\n  (esc to interrupt)\n";
        assert!(!parser.is_ready(window));
    }

    #[test]
    fn prompt_echo_alone_is_not_ready() {
        let parser = ClaudeParser::default();
        assert!(!parser.is_ready("> Some question\n"));
    }

    #[test]
    fn insert_mode_without_busy_marker_is_ready() {
        let parser = ClaudeParser::default();
        let window = ready_window("⏺ 4", 1000);
        assert!(parser.is_ready(&window));
    }

    #[test]
    fn parses_multiline_thinking() {
        let parser = ClaudeParser::default();
        let window = ready_window(
            "∴ Thinking…\n  First line of thought.\n  Second line of thought.\n  Third line with more detail.\n\n⏺ Here is the answer.",
            1000,
        );
        let response = parser.parse(&window);

        let thinking: Vec<_> = response
            .sections
            .iter()
            .filter(|s| s.kind == SectionKind::Thinking)
            .collect();
        assert_eq!(thinking.len(), 1);
        assert!(thinking[0].content.contains("First line"));
        assert!(thinking[0].content.contains("Second line"));
        assert!(thinking[0].content.contains("Third line"));

        let text: Vec<_> = response
            .sections
            .iter()
            .filter(|s| s.kind == SectionKind::Text)
            .collect();
        assert_eq!(text.len(), 1);
        assert!(text[0].content.contains("Here is the answer"));
    }

    #[test]
    fn parses_consecutive_thinking_blocks() {
        let parser = ClaudeParser::default();
        let window = ready_window(
            "∴ Thinking…\n  First round of thought.\n\n∴ Thinking…\n  Second round of thought after more processing.\n\n⏺ Final answer.",
            2000,
        );
        let response = parser.parse(&window);

        let thinking: Vec<_> = response
            .sections
            .iter()
            .filter(|s| s.kind == SectionKind::Thinking)
            .collect();
        assert_eq!(thinking.len(), 2);
        assert!(thinking[0].content.contains("First round"));
        assert!(thinking[1].content.contains("Second round"));
    }

    #[test]
    fn parses_multiple_tool_calls() {
        let parser = ClaudeParser::default();
        let window = ready_window(
            "⏺ Read(file=\"a.py\")\n⎿  content of a\n\n⏺ Read(file=\"b.py\")\n⎿  content of b\n\n⏺ Bash(command=\"ls\")\n⎿  file1  file2\n\n⏺ Done with all tools.",
            5000,
        );
        let response = parser.parse(&window);

        let tools: Vec<_> = response
            .sections
            .iter()
            .filter(|s| s.kind == SectionKind::ToolCall)
            .collect();
        assert_eq!(tools.len(), 3);
        let names: Vec<_> = tools.iter().map(|t| t.tool.as_deref().unwrap()).collect();
        assert_eq!(names.iter().filter(|n| **n == "Read").count(), 2);
        assert_eq!(names.iter().filter(|n| **n == "Bash").count(), 1);
        assert!(tools[0].content.contains("content of a"));
        assert_eq!(tools[0].metadata["args"], "file=\"a.py\"");
    }

    #[test]
    fn tool_call_with_complex_args() {
        let parser = ClaudeParser::default();
        let window = ready_window(
            "⏺ Search(pattern: \"some pattern\", path: \"/path/to/dir\", output_mode: \"content\")\n⎿  Found 5 results\n\n⏺ Found what you need.",
            3000,
        );
        let response = parser.parse(&window);

        let tools: Vec<_> = response
            .sections
            .iter()
            .filter(|s| s.kind == SectionKind::ToolCall)
            .collect();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].tool.as_deref(), Some("Search"));
        assert!(tools[0].content.contains("Found 5 results"));
    }

    #[test]
    fn extracts_token_count() {
        let parser = ClaudeParser::default();
        let response = parser.parse(&ready_window("⏺ Answer", 99999));
        assert_eq!(response.tokens, Some(99999));

        let response = parser.parse(&ready_window("⏺ Answer", 102451));
        assert_eq!(response.tokens, Some(102451));
    }

    #[test]
    fn token_extraction_tolerates_commas() {
        let parser = ClaudeParser::default();
        let window = format!(
            "> Q\n\n⏺ The table holds 20,983,267 rows.\n\n{DIVIDER}\n>\n{DIVIDER}\n  -- INSERT --   43,076 tokens\n"
        );
        let response = parser.parse(&window);
        assert_eq!(response.tokens, Some(43076));
    }

    #[test]
    fn raw_excludes_prompt_and_status_lines() {
        let parser = ClaudeParser::default();
        let window = ready_window("⏺ The answer is 4.", 1234);
        let response = parser.parse(&window);

        assert!(!response.raw.contains("> Question"));
        assert!(!response.raw.contains("-- INSERT --"));
        assert!(response.raw.contains("The answer is 4."));
    }

    #[test]
    fn suggestion_prompt_is_not_a_user_prompt() {
        let parser = ClaudeParser::default();
        let window = format!(
            "> Actual user question\n\n⏺ Some response\n\n{DIVIDER}\n> suggested completion (tab to accept)\n{DIVIDER}\n  -- INSERT --    1000 tokens\n"
        );
        let response = parser.parse(&window);
        // Response is cut after the real prompt, not after the suggestion.
        assert!(response.raw.contains("Some response"));
        assert!(!response.raw.contains("suggested completion"));
    }

    #[test]
    fn response_taken_after_compaction_marker() {
        let parser = ClaudeParser::default();
        let window = format!(
            "> Old prompt that was compacted away\n\n──── Conversation compacted ────────────────────────────────\n\n∴ Thinking…\n  Working on the new request after compaction.\n\n⏺ The answer to your question is 42.\n\n{DIVIDER}\n>\n{DIVIDER}\n  -- INSERT --    5000 tokens\n"
        );
        let response = parser.parse(&window);

        assert!(response.is_ready);
        assert!(response.raw.contains("42"));
        assert!(!response.raw.contains("Old prompt"));

        let thinking = response
            .sections
            .iter()
            .filter(|s| s.kind == SectionKind::Thinking)
            .count();
        let text: Vec<_> = response
            .sections
            .iter()
            .filter(|s| s.kind == SectionKind::Text)
            .collect();
        assert!(thinking >= 1);
        assert!(!text.is_empty());
        assert!(text[0].content.contains("42"));
    }
}
