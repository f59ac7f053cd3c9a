//! Safety Guardrails
//!
//! Decides whether generated SQL may run. The check is a keyword allow-list
//! over the `sqlparser` token stream (string literals, quoted identifiers and
//! comments are skipped), followed by a parse that must agree the statement
//! is a query. It is not an injection-proof SQL validator; ambiguous input is
//! blocked rather than guessed at.

use serde::{Deserialize, Serialize};
use sqlparser::ast::Statement;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::HashSet;
use tracing::{debug, warn};

pub const DEFAULT_ALLOWED_LEADING_KEYWORDS: &[&str] = &["select", "with", "explain", "show", "describe", "values"];

pub const DEFAULT_BLOCKED_KEYWORDS: &[&str] = &[
    "insert", "update", "delete", "merge", "upsert", "drop", "alter", "truncate", "create", "rename",
    "grant", "revoke", "attach", "detach", "copy", "call", "exec", "execute", "lock", "vacuum",
    "reindex", "analyze", "pragma", "into", "pg_sleep", "pg_terminate_backend", "pg_cancel_backend",
    "pg_read_file", "lo_import", "lo_export", "dblink",
];

/// Safety verdict for one SQL text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Allowed,
    Blocked { reason: String },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }

    fn blocked(reason: impl Into<String>) -> Self {
        Verdict::Blocked { reason: reason.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyPolicy {
    pub allowed_leading_keywords: Vec<String>,
    pub blocked_keywords: Vec<String>,
    pub allow_multiple_statements: bool,
    /// Block SQL the generic parser can't read. Off by default because
    /// dialect-specific syntax often defeats it.
    pub block_unparseable: bool,
}

impl Default for SafetyPolicy {
    fn default() -> Self {
        Self {
            allowed_leading_keywords: DEFAULT_ALLOWED_LEADING_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            blocked_keywords: DEFAULT_BLOCKED_KEYWORDS.iter().map(|s| s.to_string()).collect(),
            allow_multiple_statements: false,
            block_unparseable: false,
        }
    }
}

/// Applies a `SafetyPolicy` to SQL text.
#[derive(Debug, Clone)]
pub struct SafetyValidator {
    policy: SafetyPolicy,
    allowed_leading: HashSet<String>,
    blocked: HashSet<String>,
}

impl Default for SafetyValidator {
    fn default() -> Self {
        Self::new(SafetyPolicy::default())
    }
}

impl SafetyValidator {
    pub fn new(policy: SafetyPolicy) -> Self {
        let normalize = |list: &[String]| -> HashSet<String> {
            list.iter()
                .map(|k| k.trim().to_ascii_lowercase())
                .filter(|k| !k.is_empty())
                .collect()
        };
        Self {
            allowed_leading: normalize(&policy.allowed_leading_keywords),
            blocked: normalize(&policy.blocked_keywords),
            policy,
        }
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    pub fn validate(&self, sql: &str) -> Verdict {
        let verdict = self.check(sql);
        match &verdict {
            Verdict::Allowed => debug!("SQL allowed"),
            Verdict::Blocked { reason } => warn!("SQL blocked: {}", reason),
        }
        verdict
    }

    fn check(&self, sql: &str) -> Verdict {
        let statements = match lex_statements(sql) {
            Ok(statements) => statements,
            Err(reason) => return Verdict::blocked(reason),
        };

        if statements.is_empty() {
            return Verdict::blocked("SQL is empty");
        }
        if statements.len() > 1 && !self.policy.allow_multiple_statements {
            return Verdict::blocked(format!(
                "multiple statements are not allowed (found {})",
                statements.len()
            ));
        }

        for words in &statements {
            let Some(leading) = words.first() else {
                return Verdict::blocked("statement has no leading keyword");
            };
            if !self.allowed_leading.contains(leading) {
                return Verdict::blocked(format!("statement type `{}` is not read-only", leading));
            }
            if let Some(keyword) = words.iter().find(|w| self.blocked.contains(*w)) {
                return Verdict::blocked(format!("keyword `{}` is not allowed", keyword));
            }
        }

        self.check_parsed(sql)
    }

    fn check_parsed(&self, sql: &str) -> Verdict {
        let dialect = GenericDialect {};
        match Parser::parse_sql(&dialect, sql) {
            Ok(parsed) => match parsed.iter().find(|s| !is_read_only(s)) {
                Some(statement) => Verdict::blocked(format!(
                    "parsed statement is not a read-only query: {}",
                    statement_kind(statement)
                )),
                None => Verdict::Allowed,
            },
            Err(e) if self.policy.block_unparseable => Verdict::blocked(format!("SQL could not be parsed: {}", e)),
            Err(e) => {
                debug!("Generic SQL parser rejected statement, relying on keyword checks: {}", e);
                Verdict::Allowed
            }
        }
    }
}

fn is_read_only(statement: &Statement) -> bool {
    match statement {
        Statement::Query(_) => true,
        Statement::Explain { statement, analyze, .. } => !analyze && is_read_only(statement),
        Statement::ExplainTable { .. }
        | Statement::ShowTables { .. }
        | Statement::ShowColumns { .. }
        | Statement::ShowCreate { .. }
        | Statement::ShowVariable { .. } => true,
        _ => false,
    }
}

fn statement_kind(statement: &Statement) -> String {
    let text = statement.to_string();
    text.split_whitespace().take(2).collect::<Vec<_>>().join(" ")
}

/// Lowercased unquoted words per statement, split on `;`. String literals,
/// quoted identifiers and comments never yield words. A statement made only
/// of literals or punctuation comes back with no words.
fn lex_statements(sql: &str) -> Result<Vec<Vec<String>>, String> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize()
        .map_err(|e| format!("SQL could not be tokenized: {}", e))?;

    let mut statements = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut significant = false;
    for token in tokens {
        match token {
            Token::SemiColon => {
                if significant {
                    statements.push(std::mem::take(&mut current));
                }
                significant = false;
            }
            Token::Whitespace(_) | Token::EOF => {}
            Token::Word(word) if word.quote_style.is_none() => {
                current.push(word.value.to_lowercase());
                significant = true;
            }
            _ => significant = true,
        }
    }
    if significant {
        statements.push(current);
    }
    Ok(statements)
}
