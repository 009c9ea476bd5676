//! Prompt text processing
//!
//! Dynamic prompt groups, wildcard files, the parameter list mini-language,
//! plain text helpers and generation metadata for saved media.

pub mod dynamic;
pub mod generation;
pub mod params;
pub mod text;
pub mod wildcards;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::NodeError;

pub use dynamic::parse_dynamic_prompts;
pub use wildcards::parse_wildcards;

/// Largest value drawn when a fresh seed is needed
pub(crate) const MAX_DRAWN_SEED: u64 = 100_000;

/// How a value is picked from a list of choices
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    /// Seed modulo the list length
    #[default]
    Seed,
    /// The value at the given index, seed behavior when out of bounds
    Index,
}

impl SelectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionMode::Seed => "seed",
            SelectionMode::Index => "index",
        }
    }

    /// Index into a list of `len` items
    ///
    /// Index mode uses `seed` directly when it is in bounds, everything else
    /// wraps. `None` for an empty list.
    pub fn pick(&self, seed: u64, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        match self {
            SelectionMode::Index if seed < len as u64 => Some(seed as usize),
            _ => Some((seed % len as u64) as usize),
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SelectionMode {
    type Err = NodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "seed" => Ok(SelectionMode::Seed),
            "index" => Ok(SelectionMode::Index),
            other => Err(NodeError::invalid_input(format!(
                "Unknown selection mode: {}",
                other
            ))),
        }
    }
}

/// Seeded source of the extra draws made while expanding a prompt
pub(crate) struct SeedSource {
    rng: ChaCha8Rng,
}

impl SeedSource {
    pub(crate) fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// A fresh seed in `0..=MAX_DRAWN_SEED`
    pub(crate) fn draw(&mut self) -> u64 {
        self.rng.random_range(0..=MAX_DRAWN_SEED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick() {
        assert_eq!(SelectionMode::Seed.pick(7, 3), Some(1));
        assert_eq!(SelectionMode::Index.pick(2, 3), Some(2));
        assert_eq!(SelectionMode::Index.pick(7, 3), Some(1));
        assert_eq!(SelectionMode::Seed.pick(7, 0), None);
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("Index".parse::<SelectionMode>().unwrap(), SelectionMode::Index);
        assert_eq!(" seed ".parse::<SelectionMode>().unwrap(), SelectionMode::Seed);
        assert!("random".parse::<SelectionMode>().is_err());
    }

    #[test]
    fn test_seed_source_is_reproducible() {
        let mut a = SeedSource::new(42);
        let mut b = SeedSource::new(42);
        for _ in 0..10 {
            let x = a.draw();
            assert_eq!(x, b.draw());
            assert!(x <= MAX_DRAWN_SEED);
        }
    }
}
