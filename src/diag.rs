// Copyright (c) 2025 Joshua Seaton
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Compiler diagnostics and entry-point statuses.

use core::fmt;

/// A position within a module's source text. Lines and columns are 1-based.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Pos {
    pub line: u32,
    pub column: u32,
}

impl Pos {
    pub(crate) const START: Pos = Pos { line: 1, column: 1 };
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A single fatal diagnostic, rendered as `path:line:column: message` when a
/// source location is known and as the bare message otherwise.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Diagnostic {
    path: Option<String>,
    pos: Option<Pos>,
    message: String,
}

impl Diagnostic {
    pub(crate) fn at(path: &str, pos: Pos, message: impl Into<String>) -> Self {
        Self {
            path: Some(path.to_owned()),
            pos: Some(pos),
            message: message.into(),
        }
    }

    pub(crate) fn bare(message: impl Into<String>) -> Self {
        Self {
            path: None,
            pos: None,
            message: message.into(),
        }
    }

    /// Attaches a location to a diagnostic raised without one. Diagnostics
    /// that already carry a location keep it.
    pub(crate) fn locate(mut self, path: &str, pos: Pos) -> Self {
        if self.path.is_none() {
            self.path = Some(path.to_owned());
            self.pos = Some(pos);
        }
        self
    }

    /// The diagnostic message without its location prefix.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The module path the diagnostic refers to, if located.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// The source position the diagnostic refers to, if located.
    pub fn pos(&self) -> Option<Pos> {
        self.pos
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.path, self.pos) {
            (Some(path), Some(pos)) => write!(f, "{path}:{pos}: {}", self.message),
            (Some(path), None) => write!(f, "{path}: {}", self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

/// Errors surfaced by the two entry points. Each maps to the negative status
/// returned through the linear-memory contract; the rendered diagnostic is
/// also written as a zero-terminated string at the output base.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// The path pointer was null or the path was empty.
    PathMissing,
    /// The content pointer was null.
    ContentMissing,
    /// The module registry already holds the maximum number of modules.
    ModuleTableFull,
    /// Module storage could not hold the path and content bytes.
    StorageExhausted,
    /// No module is loaded under the requested path.
    ModuleNotLoaded,
    /// The registry entry for the requested path has no content bytes.
    CachedModuleMissingContent,
    /// The pipeline failed; the payload carries the located detail.
    Compile(Diagnostic),
}

impl Error {
    /// The negative status word reported to hosts.
    pub fn status(&self) -> i32 {
        match self {
            Error::PathMissing => -1,
            Error::ContentMissing => -2,
            Error::ModuleTableFull => -3,
            Error::StorageExhausted => -4,
            Error::ModuleNotLoaded => -5,
            Error::CachedModuleMissingContent => -6,
            Error::Compile(_) => -7,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::PathMissing => write!(f, "module path missing"),
            Error::ContentMissing => write!(f, "module content missing"),
            Error::ModuleTableFull => write!(f, "module table full"),
            Error::StorageExhausted => write!(f, "linear memory exhausted"),
            Error::ModuleNotLoaded => write!(f, "module not loaded"),
            Error::CachedModuleMissingContent => {
                write!(f, "cached module entry missing content")
            }
            Error::Compile(diagnostic) => write!(f, "{diagnostic}"),
        }
    }
}

impl core::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn located_diagnostic_format() {
        let diagnostic = Diagnostic::at(
            "/lib/math.bt",
            Pos { line: 3, column: 7 },
            "identifier not found",
        );
        assert_eq!(diagnostic.to_string(), "/lib/math.bt:3:7: identifier not found");
    }

    #[test]
    fn bare_diagnostic_format() {
        let diagnostic = Diagnostic::bare("linear memory exhausted");
        assert_eq!(diagnostic.to_string(), "linear memory exhausted");
    }

    #[test]
    fn statuses_are_negative_and_distinct() {
        let errors = [
            Error::PathMissing,
            Error::ContentMissing,
            Error::ModuleTableFull,
            Error::StorageExhausted,
            Error::ModuleNotLoaded,
            Error::CachedModuleMissingContent,
            Error::Compile(Diagnostic::bare("x")),
        ];
        let statuses: Vec<i32> = errors.iter().map(Error::status).collect();
        assert!(statuses.iter().all(|&status| status < 0));
        for (i, a) in statuses.iter().enumerate() {
            for b in &statuses[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
