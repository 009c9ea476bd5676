//! Wildcard files: `__HairColors__` becomes one line of `HairColors.txt`

use log::{debug, warn};
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use walkdir::WalkDir;

use super::{SeedSource, SelectionMode};
use crate::folders::to_slash;

static WILDCARD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"__.*?__").expect("valid wildcard pattern"));

/// Text before this divider on a wildcard line is a note and is dropped
pub const COMMENTARY_DIVIDER: &str = " ## ";

/// Replacements after which expansion stops, guards self-referencing files
const MAX_REPLACEMENTS: usize = 1000;

/// Replace every `__name__` in `text` with a line of `<dir>/name.txt`
///
/// Names may point into subdirectories (`__colors/hair__`). Replacement
/// text is scanned again, so wildcard files may reference each other. A
/// wildcard without a file is removed. Unless
/// `same_seed_for_multiple_occurrences` is set, a repeated wildcard draws
/// a fresh seed from a generator seeded by `seed`. The result is trimmed.
pub fn parse_wildcards(
    text: &str,
    wildcards_dir: &Path,
    mode: SelectionMode,
    seed: u64,
    same_seed_for_multiple_occurrences: bool,
) -> String {
    let files = list_wildcard_files(wildcards_dir);
    let mut draws = SeedSource::new(seed);
    let mut seen: HashSet<String> = HashSet::new();
    let mut text = text.to_string();

    for _ in 0..MAX_REPLACEMENTS {
        let (range, name) = match WILDCARD.find(&text) {
            Some(m) => (m.range(), m.as_str()[2..m.len() - 2].replace('\\', "/")),
            None => return text.trim().to_string(),
        };
        let file_name = format!("{}.txt", name);

        let replacement = if files.contains(&file_name) {
            let mut seed_to_use = seed;
            if !same_seed_for_multiple_occurrences && !seen.insert(name.clone()) {
                seed_to_use = draws.draw();
            }
            read_wildcard(&wildcards_dir.join(&file_name), mode, seed_to_use)
        } else {
            warn!("Wildcard file not found for __{}__", name);
            String::new()
        };

        text.replace_range(range, &replacement);
    }

    warn!(
        "Stopped expanding wildcards after {} replacements",
        MAX_REPLACEMENTS
    );
    text.trim().to_string()
}

/// `.txt` files below the wildcard directory, `/` separated
fn list_wildcard_files(dir: &Path) -> HashSet<String> {
    WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.path().strip_prefix(dir).ok().map(to_slash))
        .filter(|name| name.ends_with(".txt"))
        .collect()
}

/// Pick one line of a wildcard file
///
/// Everything before the first ` ## ` on the line is dropped; the rest up
/// to a further divider is kept.
pub fn read_wildcard(path: &Path, mode: SelectionMode, seed: u64) -> String {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            warn!("Unable to read wildcard file {:?}: {}", path, e);
            return String::new();
        }
    };
    let lines: Vec<&str> = content.lines().collect();

    let line = match mode.pick(seed, lines.len()) {
        Some(i) => lines[i],
        None => {
            debug!("Wildcard file {:?} is empty", path);
            return String::new();
        }
    };

    let line = match line.split(COMMENTARY_DIVIDER).nth(1) {
        Some(after) => after,
        None => line,
    };
    line.trim().to_string()
}
