//! Split descriptors
//!
//! A `SplitSpec` names "the index-th of total contiguous slices" of an
//! ordered input whose length is only known once the input is materialized.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use crate::error::{Error, Result};

/// One contiguous slice out of `total`, 1-based
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SplitSpec {
    index: usize,
    total: usize,
}

impl SplitSpec {
    /// Creates a split descriptor, enforcing `1 <= index <= total`
    pub fn new(index: usize, total: usize) -> Result<Self> {
        if index == 0 || total == 0 {
            return Err(Error::InvalidSplitFormat(format!(
                "{}/{}: index and total must be positive",
                index, total
            )));
        }
        if index > total {
            return Err(Error::InvalidSplitFormat(format!(
                "{}/{}: index exceeds total",
                index, total
            )));
        }
        Ok(Self { index, total })
    }

    /// The whole input as a single slice
    pub fn whole() -> Self {
        Self { index: 1, total: 1 }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Half-open range this slice covers in an input of `len` items
    ///
    /// Boundaries are `len * (index - 1) / total` and `len * index / total`,
    /// so slices of any `total` tile the input exactly and a block of
    /// consecutive fine slices lines up with the coarse slice it refines.
    pub fn range(&self, len: usize) -> Range<usize> {
        let bound = |i: usize| ((len as u128 * i as u128) / self.total as u128) as usize;
        bound(self.index - 1)..bound(self.index)
    }
}

impl fmt::Display for SplitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.total)
    }
}

impl FromStr for SplitSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (index, total) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::InvalidSplitFormat(format!("'{}': expected K/N", s)))?;

        let parse = |part: &str| {
            part.parse::<usize>().map_err(|_| {
                Error::InvalidSplitFormat(format!("'{}': '{}' is not a positive integer", s, part))
            })
        };

        Self::new(parse(index)?, parse(total)?)
    }
}
