// Bounded buffer for worker stdout/stderr.

use std::collections::VecDeque;

const TRUNCATION_MARKER: &str = "[... earlier output truncated ...]";

/// Which worker stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Keeps the most recent worker output lines within a byte budget.
/// Older lines are evicted first, since tracebacks end up at the tail.
#[derive(Debug, Clone)]
pub struct Diagnostics {
    lines: VecDeque<(StreamKind, String)>,
    bytes: usize,
    max_bytes: usize,
    truncated: bool,
}

impl Diagnostics {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            max_bytes,
            truncated: false,
        }
    }

    pub fn push(&mut self, kind: StreamKind, line: &str) {
        let line = line.trim_end();
        if line.is_empty() {
            return;
        }

        // A single line larger than the whole budget keeps only its tail.
        let line = if line.len() > self.max_bytes {
            self.truncated = true;
            let mut start = line.len() - self.max_bytes;
            while !line.is_char_boundary(start) {
                start += 1;
            }
            &line[start..]
        } else {
            line
        };

        self.bytes += line.len();
        self.lines.push_back((kind, line.to_string()));

        while self.bytes > self.max_bytes {
            match self.lines.pop_front() {
                Some((_, evicted)) => {
                    self.bytes -= evicted.len();
                    self.truncated = true;
                }
                None => break,
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.bytes = 0;
        self.truncated = false;
    }

    /// Stderr only, falling back to everything when the worker wrote nothing there.
    pub fn stderr_text(&self) -> String {
        let stderr: Vec<&str> = self
            .lines
            .iter()
            .filter(|(kind, _)| *kind == StreamKind::Stderr)
            .map(|(_, line)| line.as_str())
            .collect();
        if stderr.is_empty() {
            return self.text();
        }
        self.with_marker(stderr)
    }

    pub fn text(&self) -> String {
        self.with_marker(self.lines.iter().map(|(_, line)| line.as_str()).collect())
    }

    fn with_marker(&self, lines: Vec<&str>) -> String {
        let mut out = Vec::with_capacity(lines.len() + 1);
        if self.truncated {
            out.push(TRUNCATION_MARKER);
        }
        out.extend(lines);
        out.join("\n")
    }

    /// One-line explanation of a failure: the first `[ERROR]`-tagged line if
    /// the worker emitted one, else the last line it wrote.
    pub fn summary(&self) -> Option<String> {
        self.lines
            .iter()
            .find_map(|(_, line)| {
                line.find("[ERROR]")
                    .map(|idx| line[idx + "[ERROR]".len()..].trim().to_string())
                    .filter(|s| !s.is_empty())
            })
            .or_else(|| self.lines.back().map(|(_, line)| line.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_lines_in_order() {
        let mut diag = Diagnostics::new(1024);
        diag.push(StreamKind::Stdout, "loading\n");
        diag.push(StreamKind::Stderr, "boom");
        assert_eq!(diag.text(), "loading\nboom");
        assert_eq!(diag.stderr_text(), "boom");
    }

    #[test]
    fn test_blank_lines_ignored() {
        let mut diag = Diagnostics::new(1024);
        diag.push(StreamKind::Stdout, "   \n");
        assert!(diag.is_empty());
    }

    #[test]
    fn test_evicts_oldest_when_over_budget() {
        let mut diag = Diagnostics::new(10);
        diag.push(StreamKind::Stderr, "aaaa");
        diag.push(StreamKind::Stderr, "bbbb");
        diag.push(StreamKind::Stderr, "cccc");
        assert!(diag.len_bytes() <= 10);
        let text = diag.text();
        assert!(text.starts_with(TRUNCATION_MARKER));
        assert!(!text.contains("aaaa"));
        assert!(text.ends_with("bbbb\ncccc"));
    }

    #[test]
    fn test_oversized_line_keeps_tail() {
        let mut diag = Diagnostics::new(4);
        diag.push(StreamKind::Stderr, "0123456789");
        assert_eq!(diag.len_bytes(), 4);
        assert!(diag.text().ends_with("6789"));
    }

    #[test]
    fn test_summary_prefers_error_marker() {
        let mut diag = Diagnostics::new(1024);
        diag.push(StreamKind::Stdout, "[WORKER] [LOAD_IMAGE] loading");
        diag.push(StreamKind::Stdout, "[WORKER] [ERROR] Failed to load image: truncated");
        diag.push(StreamKind::Stderr, "Traceback (most recent call last):");
        assert_eq!(
            diag.summary().as_deref(),
            Some("Failed to load image: truncated")
        );
    }

    #[test]
    fn test_summary_falls_back_to_last_line() {
        let mut diag = Diagnostics::new(1024);
        diag.push(StreamKind::Stderr, "first");
        diag.push(StreamKind::Stderr, "segmentation fault");
        assert_eq!(diag.summary().as_deref(), Some("segmentation fault"));
        assert_eq!(Diagnostics::new(16).summary(), None);
    }
}
