//! Debugger prompt heuristics.
//!
//! A pane or buffer "looks like a debugger" when it contains one of a
//! configurable set of prompt strings. This misses custom prompts; the set is
//! configurable rather than fixed so users can add theirs.

use regex::Regex;
use std::sync::LazyLock;

static DEBUGGER_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bgdb(?:-multiarch)?\b").expect("debugger command pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPatterns {
    patterns: Vec<String>,
}

impl PromptPatterns {
    pub fn new(patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            patterns: patterns
                .into_iter()
                .map(Into::into)
                .filter(|p: &String| !p.is_empty())
                .collect(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// True when the last non-blank line of `text` begins with a prompt.
    pub fn ends_with_prompt(&self, text: &str) -> bool {
        text.lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(|line| self.is_prompt_line(line))
            .unwrap_or(false)
    }

    fn is_prompt_line(&self, line: &str) -> bool {
        let line = line.trim_start();
        self.patterns.iter().any(|p| line.starts_with(p.as_str()))
    }

    fn is_bare_prompt(&self, line: &str) -> bool {
        let line = line.trim();
        self.patterns.iter().any(|p| line == p.trim())
    }

    /// Removes a prompt glued to the front of the first line, trailing bare
    /// prompt lines and surrounding whitespace from extracted command output.
    ///
    /// Without a terminal the debugger prints its prompt right before the
    /// next output, so `(gdb) $1 = 42` is output, not a prompt line.
    pub fn clean_output(&self, raw: &str) -> String {
        let mut lines: Vec<&str> = raw.lines().collect();
        if let Some(first) = lines.iter_mut().find(|line| !line.trim().is_empty()) {
            *first = self.strip_prompt(*first);
        }
        while let Some(last) = lines.last() {
            if last.trim().is_empty() || self.is_bare_prompt(last) {
                lines.pop();
            } else {
                break;
            }
        }
        lines.join("\n").trim().to_string()
    }

    fn strip_prompt<'a>(&self, line: &'a str) -> &'a str {
        let trimmed = line.trim_start();
        self.patterns
            .iter()
            .find_map(|p| trimmed.strip_prefix(p.as_str()))
            .map(str::trim_start)
            .unwrap_or(line)
    }
}

impl Default for PromptPatterns {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_PROMPTS.iter().copied())
    }
}

/// Whether a process command line names a debugger front end. Stub servers
/// such as `gdbserver` are excluded.
pub fn is_debugger_command(command: &str) -> bool {
    !command.to_lowercase().contains("gdbserver") && DEBUGGER_COMMAND.is_match(command)
}
