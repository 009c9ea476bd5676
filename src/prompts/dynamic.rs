//! Dynamic prompt groups: `{apple::0.7|orange|banana::1.3}`

use log::debug;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use super::{SeedSource, SelectionMode};
use crate::error::{NodeError, Result};

/// Innermost group, braces included
static GROUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^{}]+\}").expect("valid group pattern"));

/// Upper bound on the copies of a single weighted option
const MAX_REPEATS: f64 = 10_000.0;

/// Replace every dynamic prompt group in `text` with one of its options
///
/// Groups are resolved innermost first until none remain. Options are
/// separated by `|` and may carry a weight after `::` (default 1.0, or 0.1
/// in index mode); an option is repeated `int(weight * 10)` times in the
/// list that is drawn from.
///
/// In index mode a `seed` inside the group's bounds picks that option
/// directly. Otherwise each group after the first draws its own seed from
/// a generator seeded by `seed`, unless `same_seed_for_all_groups` is set.
/// With `enforce_different_outputs` a repeated selection is redrawn from
/// the options not chosen yet, when any are left.
pub fn parse_dynamic_prompts(
    text: &str,
    mode: SelectionMode,
    seed: u64,
    same_seed_for_all_groups: bool,
    enforce_different_outputs: bool,
) -> Result<String> {
    let mut text = text.to_string();
    let mut draws = SeedSource::new(seed);
    let mut selected: HashSet<String> = HashSet::new();
    let mut group_index: u64 = 0;

    while let Some(found) = GROUP.find(&text) {
        let range = found.range();
        let inner = &text[range.start + 1..range.end - 1];
        let options: Vec<&str> = inner.split('|').collect();

        let use_index = mode == SelectionMode::Index && seed < options.len() as u64;
        let weighted = weighted_options(&options, use_index)?;

        let seed_to_use = if use_index || same_seed_for_all_groups {
            seed
        } else {
            seed.wrapping_add(group_index.wrapping_mul(draws.draw()))
        };
        let pick_mode = if use_index {
            SelectionMode::Index
        } else {
            SelectionMode::Seed
        };
        let mut choice = pick_mode
            .pick(seed_to_use, weighted.len())
            .map(|i| weighted[i].clone())
            .unwrap_or_default();

        if enforce_different_outputs && selected.contains(&choice) {
            let remaining: Vec<&String> =
                weighted.iter().filter(|o| !selected.contains(*o)).collect();
            if !remaining.is_empty() {
                choice = remaining[(draws.draw() % remaining.len() as u64) as usize].clone();
                selected.insert(choice.clone());
            }
        } else {
            selected.insert(choice.clone());
        }

        text.replace_range(range, &choice);
        group_index += 1;
    }

    Ok(text)
}

/// Expand options into the list drawn from, each repeated by its weight
fn weighted_options(options: &[&str], use_index: bool) -> Result<Vec<String>> {
    let default_weight = if use_index { 0.1 } else { 1.0 };
    let mut weighted = Vec::new();

    for option in options {
        let mut parts = option.split("::");
        let choice = parts.next().unwrap_or_default().trim();
        let weight = match parts.next() {
            Some(w) => w.trim().parse::<f64>().map_err(|_| {
                NodeError::invalid_input(format!("Invalid weight '{}' in option '{}'", w.trim(), choice))
            })?,
            None => default_weight,
        };
        let repeats = (weight * 10.0).clamp(0.0, MAX_REPEATS) as usize;
        weighted.extend(std::iter::repeat(choice.to_string()).take(repeats));
    }

    if weighted.is_empty() {
        debug!("Every option weighs zero, drawing from the options as written");
        weighted = options
            .iter()
            .map(|o| o.split("::").next().unwrap_or_default().trim().to_string())
            .collect();
    }

    Ok(weighted)
}
