//! Plain text helpers for prompt editing

use log::warn;
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{NodeError, Result};

static ANGLE_BRACKETS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(.*?)>").expect("valid bracket pattern"));

static PARSEABLE_DATA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(.*?)>|\n|\\n").expect("valid parseable data pattern"));

static PROMPT_WEIGHT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":\d+\.*\d*").expect("valid weight pattern"));

/// Separator between search and replacement in a replacement list
pub const REPLACEMENT_ARROW: &str = "->";

/// Remove enclosed comments and commented lines
///
/// Text between `enclosed_start` and `enclosed_end` is removed along with
/// the markers, then every line whose trimmed text starts with
/// `line_comment` is dropped. Empty markers disable the matching step.
pub fn remove_commented_text(
    text: &str,
    line_comment: &str,
    enclosed_start: &str,
    enclosed_end: &str,
) -> String {
    let mut text = text.to_string();

    if !enclosed_start.is_empty() && !enclosed_end.is_empty() {
        let pattern = format!(
            r"{}[\s\S]+?{}",
            regex::escape(enclosed_start),
            regex::escape(enclosed_end)
        );
        if let Ok(enclosed) = Regex::new(&pattern) {
            text = enclosed.replace_all(&text, "").into_owned();
        }
        text = text.replace(&format!("{}{}", enclosed_start, enclosed_end), "");
    }

    if line_comment.is_empty() {
        return text;
    }
    text.split('\n')
        .filter(|line| !line.trim().starts_with(line_comment))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split at `split_at`, drop blank pieces and join with `join_with`
pub fn split_and_join(text: &str, split_at: &str, join_with: &str) -> String {
    if split_at.is_empty() {
        return text.to_string();
    }
    text.split(split_at)
        .filter(|piece| !piece.trim().is_empty())
        .collect::<Vec<_>>()
        .join(join_with)
}

pub fn trim_and_strip(text: &str) -> String {
    text.trim().to_string()
}

/// Every `<...>` block mentioning `lora`, one per line
pub fn extract_loras(text: &str) -> String {
    ANGLE_BRACKETS
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .filter(|inner| inner.as_str().contains("lora"))
        .map(|inner| format!("<{}>", inner.as_str()))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Remove `<...>` blocks, newlines and empty comma-separated pieces
pub fn remove_parseable_data(text: &str) -> String {
    let stripped = PARSEABLE_DATA.replace_all(text, "");
    stripped
        .split(',')
        .filter(|piece| !piece.is_empty())
        .collect::<Vec<_>>()
        .join(",")
        .trim()
        .to_string()
}

/// Sections of a single-subject prompt, joined one per line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SingleSubjectPrompt<'a> {
    pub subject: &'a str,
    pub hair: &'a str,
    pub clothing: &'a str,
    pub actions: &'a str,
    pub extras: &'a str,
    /// Network definitions with their trigger words, e.g. `<lora:dog:0.7> cute dog`
    pub networks: &'a str,
}

pub fn build_single_subject_prompt(parts: &SingleSubjectPrompt<'_>) -> String {
    [
        parts.subject,
        parts.hair,
        parts.clothing,
        parts.actions,
        parts.extras,
        parts.networks,
    ]
    .join("\n")
}

/// Replace every key with its value in a single pass
///
/// Keys are tried in order at each position, so earlier keys win when they
/// overlap. With `whole_words` keys only match at word boundaries. The
/// result is trimmed.
pub fn search_and_replace_pairs(
    text: &str,
    pairs: &[(String, String)],
    whole_words: bool,
) -> Result<String> {
    let keys: Vec<String> = pairs
        .iter()
        .filter(|(search, _)| !search.is_empty())
        .map(|(search, _)| {
            if whole_words {
                format!(r"\b{}\b", regex::escape(search))
            } else {
                regex::escape(search)
            }
        })
        .collect();
    if keys.is_empty() {
        return Ok(text.trim().to_string());
    }

    let pattern = Regex::new(&keys.join("|"))
        .map_err(|e| NodeError::invalid_input(format!("Invalid replacement list: {}", e)))?;
    let replaced = pattern.replace_all(text, |caps: &regex::Captures| {
        let found = &caps[0];
        pairs
            .iter()
            .rev()
            .find(|(search, _)| search == found)
            .map(|(_, replace)| replace.clone())
            .unwrap_or_else(|| found.to_string())
    });
    Ok(replaced.trim().to_string())
}

/// Parse `search->replace` lines; blank lines are skipped
pub fn parse_replacement_list(list: &str) -> Result<Vec<(String, String)>> {
    list.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.split_once(REPLACEMENT_ARROW)
                .map(|(search, replace)| (search.to_string(), replace.to_string()))
                .ok_or_else(|| {
                    NodeError::invalid_input(format!(
                        "Replacement line '{}' has no '{}'",
                        line, REPLACEMENT_ARROW
                    ))
                })
        })
        .collect()
}

pub fn search_and_replace_from_list(text: &str, list: &str) -> Result<String> {
    let pairs = parse_replacement_list(list)?;
    search_and_replace_pairs(text, &pairs, false)
}

/// Like [`search_and_replace_from_list`] with the list read from a file
///
/// A missing file leaves the text unchanged.
pub fn search_and_replace_from_file(text: &str, path: &Path) -> Result<String> {
    if !path.exists() {
        warn!("Prompt will not be edited. File not found at {:?}", path);
        return Ok(text.to_string());
    }
    let list = fs::read_to_string(path).map_err(|e| NodeError::from(e).with_path(path))?;
    search_and_replace_from_list(text, &list)
}

pub fn search_and_replace(text: &str, search: &str, replace_with: &str) -> Result<String> {
    search_and_replace_pairs(text, &[(search.to_string(), replace_with.to_string())], false)
}

/// Lines of a text sorted by their leading delimiter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeparatedStrings {
    /// Lines starting with none of the delimiters
    pub all: String,
    pub a: String,
    pub b: String,
    pub c: String,
}

/// Sort trimmed lines into buckets by delimiter, removing the delimiter
///
/// Every line keeps a trailing newline. An empty delimiter matches nothing.
pub fn separate_string_by_delimiters(
    input: &str,
    delimiter_a: &str,
    delimiter_b: &str,
    delimiter_c: &str,
) -> SeparatedStrings {
    let mut out = SeparatedStrings::default();
    for line in input.lines().map(str::trim) {
        let strip = |delimiter: &str| -> Option<String> {
            if delimiter.is_empty() {
                None
            } else {
                line.strip_prefix(delimiter).map(str::to_string)
            }
        };
        let (bucket, rest) = if let Some(rest) = strip(delimiter_a) {
            (&mut out.a, rest)
        } else if let Some(rest) = strip(delimiter_b) {
            (&mut out.b, rest)
        } else if let Some(rest) = strip(delimiter_c) {
            (&mut out.c, rest)
        } else {
            (&mut out.all, line.to_string())
        };
        bucket.push_str(&rest);
        bucket.push('\n');
    }
    out
}

/// Strip weights, parentheses, embedding prefixes and parseable data
pub fn clean_text_for_token_count(text: &str) -> String {
    let cleaned = PROMPT_WEIGHT.replace_all(text, "");
    let cleaned = cleaned
        .replace(['(', ')'], "")
        .replace("embedding:", "");
    remove_parseable_data(&cleaned).trim().to_string()
}

/// `count / capacity` where capacity is whole sections of `max_length`
pub fn format_token_count(count: usize, max_length: usize) -> String {
    let max_length = max_length.max(1);
    let sections = count.div_ceil(max_length).max(1);
    format!("{} / {}", count, max_length * sections)
}
