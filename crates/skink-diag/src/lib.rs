//! Structured diagnostics shared by every compiler pass.
//!
//! Passes push span-carrying messages into a [`Diagnostics`] sink; the driver
//! decides what to render and whether the pipeline may continue. Only
//! `Error`-severity entries stop compilation.

use std::fmt;

use skink_lexer::Span;

/// How severe a diagnostic is. `Debug` and `Verbose` are only shown when the
/// matching CLI flags are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Debug,
    Verbose,
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Verbose => "verbose",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub span: Span,
}

/// Accumulating sink. One per compilation; every pass appends to it.
#[derive(Debug, Default)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
    error_count: usize,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, severity: Severity, message: impl Into<String>, span: Span) {
        if severity == Severity::Error {
            self.error_count += 1;
        }
        self.entries.push(Diagnostic {
            severity,
            message: message.into(),
            span,
        });
    }

    pub fn error(&mut self, message: impl Into<String>, span: Span) {
        self.push(Severity::Error, message, span);
    }

    pub fn warning(&mut self, message: impl Into<String>, span: Span) {
        self.push(Severity::Warning, message, span);
    }

    pub fn info(&mut self, message: impl Into<String>, span: Span) {
        self.push(Severity::Info, message, span);
    }

    pub fn verbose(&mut self, message: impl Into<String>, span: Span) {
        self.push(Severity::Verbose, message, span);
    }

    pub fn note(&mut self, message: impl Into<String>, span: Span) {
        self.push(Severity::Debug, message, span);
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }

    pub fn error_count(&self) -> usize {
        self.error_count
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }
}

/// Translate a byte offset into a 1-based (line, column) pair.
pub fn line_col(source: &str, offset: u32) -> (u32, u32) {
    let offset = (offset as usize).min(source.len());
    let mut line = 1;
    let mut col = 1;
    for b in source.as_bytes()[..offset].iter() {
        if *b == b'\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Render one diagnostic as `severity: file:line:col: message`.
pub fn render(diag: &Diagnostic, file: &str, source: &str) -> String {
    let (line, col) = line_col(source, diag.span.start);
    format!(
        "{}: {}:{}:{}: {}",
        diag.severity, file, line, col, diag.message
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_counted() {
        let mut diags = Diagnostics::new();
        assert!(!diags.has_errors());
        diags.warning("odd but fine", Span::new(0, 1));
        assert!(!diags.has_errors());
        diags.error("broken", Span::new(2, 3));
        assert!(diags.has_errors());
        assert_eq!(diags.error_count(), 1);
        assert_eq!(diags.iter().count(), 2);
    }

    #[test]
    fn line_col_is_one_based() {
        let src = "ab\ncde\nf";
        assert_eq!(line_col(src, 0), (1, 1));
        assert_eq!(line_col(src, 1), (1, 2));
        assert_eq!(line_col(src, 3), (2, 1));
        assert_eq!(line_col(src, 5), (2, 3));
        assert_eq!(line_col(src, 7), (3, 1));
    }

    #[test]
    fn render_format() {
        let mut diags = Diagnostics::new();
        diags.error("unexpected token", Span::new(3, 4));
        let d = diags.iter().next().unwrap();
        assert_eq!(
            render(d, "test.sk", "ab\ncde"),
            "error: test.sk:2:1: unexpected token"
        );
    }
}
