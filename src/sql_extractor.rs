//! SQL Extractor - splits a raw model response into reasoning and SQL
//!
//! Understands the `Reasoning: ... SQL: ...` format requested by
//! `prompt::PromptBuilder`. Responses that ignore the format are handled by
//! falling back to a fenced code block, then to a line opening with
//! `SELECT`/`WITH`. A response without SQL is a normal outcome, not an error.

use crate::error::{Result, Text2SqlError};
use crate::prompt::{REASONING_LABEL, SQL_LABEL};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref SQL_LABEL_RE: Regex =
        Regex::new(&format!(r"(?m)^[ \t]*(?:\*\*)?{}(?:\*\*)?[ \t]*", regex::escape(SQL_LABEL)))
            .expect("SQL label regex");
    static ref REASONING_LABEL_RE: Regex =
        Regex::new(&format!(r"^\s*(?:\*\*)?{}(?:\*\*)?\s*", regex::escape(REASONING_LABEL)))
            .expect("reasoning label regex");
    static ref FENCE_RE: Regex = Regex::new(r"(?s)```([A-Za-z]*)[ \t]*\r?\n?(.*?)```").expect("fence regex");
    static ref BARE_SQL_RE: Regex = Regex::new(r"(?m)^[ \t]*(?:SELECT|WITH)\s").expect("bare SQL regex");
    static ref BLANK_LINE_RE: Regex = Regex::new(r"\n[ \t]*\r?\n").expect("blank line regex");
}

/// Parsed model output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub raw_text: String,
    pub reasoning: Option<String>,
    pub extracted_sql: Option<String>,
}

impl GenerationResponse {
    pub fn has_sql(&self) -> bool {
        self.extracted_sql.is_some()
    }

    /// The extracted SQL, or `NoSqlFound`.
    pub fn require_sql(&self) -> Result<&str> {
        self.extracted_sql.as_deref().ok_or(Text2SqlError::NoSqlFound)
    }
}

pub fn extract(raw_text: &str) -> GenerationResponse {
    let (reasoning, sql) = split_labeled(raw_text)
        .or_else(|| split_fenced(raw_text))
        .or_else(|| split_bare(raw_text))
        .unwrap_or_else(|| (raw_text.to_string(), None));

    GenerationResponse {
        raw_text: raw_text.to_string(),
        reasoning: non_empty(clean_reasoning(&reasoning)),
        extracted_sql: sql,
    }
}

/// `... SQL: <statement>`; the last label wins so reasoning may quote the word.
fn split_labeled(raw: &str) -> Option<(String, Option<String>)> {
    let label = SQL_LABEL_RE.find_iter(raw).last()?;
    let before = &raw[..label.start()];
    let after = &raw[label.end()..];
    Some((before.to_string(), clean_sql_segment(after)))
}

fn split_fenced(raw: &str) -> Option<(String, Option<String>)> {
    for caps in FENCE_RE.captures_iter(raw) {
        let lang = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        let is_sql = lang.eq_ignore_ascii_case("sql") || (lang.is_empty() && BARE_SQL_RE.is_match(body));
        if is_sql {
            let start = caps.get(0).map(|m| m.start()).unwrap_or(0);
            return Some((raw[..start].to_string(), non_empty(body.trim().to_string())));
        }
    }
    None
}

/// A statement starting at a line that opens with `SELECT` or `WITH`,
/// running until the next blank line.
fn split_bare(raw: &str) -> Option<(String, Option<String>)> {
    let found = BARE_SQL_RE.find(raw)?;
    Some((raw[..found.start()].to_string(), non_empty(first_paragraph(&raw[found.start()..]))))
}

fn clean_sql_segment(segment: &str) -> Option<String> {
    if let Some(caps) = FENCE_RE.captures(segment) {
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        return non_empty(body.trim().to_string());
    }
    // unterminated fence
    let mut text = segment.trim();
    if let Some(stripped) = text.strip_prefix("```") {
        text = stripped.trim_start_matches(|c: char| c.is_ascii_alphabetic());
    }
    non_empty(first_paragraph(text.trim_end_matches("```")))
}

/// Text up to the first blank line; models often add commentary after the
/// statement.
fn first_paragraph(text: &str) -> String {
    let text = text.trim();
    let end = BLANK_LINE_RE.find(text).map(|m| m.start()).unwrap_or(text.len());
    text[..end].trim().to_string()
}

fn clean_reasoning(text: &str) -> String {
    REASONING_LABEL_RE.replace(text, "").trim().to_string()
}

fn non_empty(text: String) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}
