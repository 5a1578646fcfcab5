//! Test selection
//!
//! An ordered, line-delimited list of test identifiers produced upstream.
//! Splitting only ever looks at its length; the identifiers are copied
//! through untouched.

use std::path::Path;

use crate::domain::SplitSpec;

/// Ordered list of test identifiers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    tests: Vec<String>,
}

impl Selection {
    /// Parses a line-delimited list, skipping blank lines
    pub fn parse(contents: &str) -> Self {
        let tests = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        Self { tests }
    }

    /// Reads a selection file
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    pub fn len(&self) -> usize {
        self.tests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    /// Tests covered by one slice
    pub fn slice(&self, split: &SplitSpec) -> &[String] {
        &self.tests[split.range(self.tests.len())]
    }

    /// Line-delimited rendering of one slice
    pub fn render(&self, split: &SplitSpec) -> String {
        let mut out = String::new();
        for test in self.slice(split) {
            out.push_str(test);
            out.push('\n');
        }
        out
    }
}
