//! Prompt Builder - renders retrieved schema and a question into a model prompt
//!
//! The response format requested here (a `Reasoning:` block followed by an
//! `SQL:` block) is what `sql_extractor` parses. `render_response` produces that
//! format and is the fixture both sides are tested against.

use crate::schema_rag::ScoredEntry;
use std::fmt::Write;

/// Label that opens the reasoning block of a model response.
pub const REASONING_LABEL: &str = "Reasoning:";
/// Label that opens the SQL block of a model response.
pub const SQL_LABEL: &str = "SQL:";

const SYSTEM_INSTRUCTIONS: &str = "You are an expert SQL analyst. Translate the user's question into a single SQL query.";

const RESPONSE_RULES: &str = r#"Rules:
1. First explain your reasoning: which tables and columns answer the question and how they join.
2. Then write exactly one SQL statement. Do not write multiple statements.
3. Use only the tables and columns listed above. Never invent tables or columns.
4. The query must be read-only (SELECT or WITH ... SELECT).

Respond in exactly this format:
Reasoning: <your explanation>
SQL:
```sql
<one SQL statement>
```"#;

/// Deterministic prompt renderer.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    dialect: Option<String>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the SQL dialect in the prompt, e.g. "PostgreSQL".
    pub fn with_dialect(mut self, dialect: impl Into<String>) -> Self {
        self.dialect = Some(dialect.into());
        self
    }

    pub fn build(&self, question: &str, retrieved: &[ScoredEntry]) -> String {
        let mut prompt = String::new();
        self.write_header(&mut prompt, retrieved);
        let _ = write!(prompt, "Question: {}\n\n{}\n", question.trim(), RESPONSE_RULES);
        prompt
    }

    /// Prompt asking the model to correct a statement that failed.
    ///
    /// Keeps the same response format as `build`.
    pub fn build_repair(
        &self,
        question: &str,
        retrieved: &[ScoredEntry],
        previous_sql: &str,
        error_message: &str,
    ) -> String {
        let mut prompt = String::new();
        self.write_header(&mut prompt, retrieved);
        let _ = write!(
            prompt,
            "Question: {}\n\nA previous attempt produced this SQL:\n```sql\n{}\n```\n\nIt failed with:\n{}\n\nFix the query so it answers the question.\n\n{}\n",
            question.trim(),
            previous_sql.trim(),
            error_message.trim(),
            RESPONSE_RULES
        );
        prompt
    }

    fn write_header(&self, prompt: &mut String, retrieved: &[ScoredEntry]) {
        prompt.push_str(SYSTEM_INSTRUCTIONS);
        prompt.push('\n');
        if let Some(dialect) = &self.dialect {
            let _ = writeln!(prompt, "Target SQL dialect: {}.", dialect);
        }
        prompt.push_str("\nDatabase schema:\n\n");
        if retrieved.is_empty() {
            prompt.push_str("(no relevant tables found)\n\n");
        }
        for scored in retrieved {
            render_table(prompt, scored);
        }
    }
}

fn render_table(prompt: &mut String, scored: &ScoredEntry) {
    let entry = &scored.entry;
    let _ = writeln!(prompt, "Table: {}", entry.name);
    prompt.push_str("Columns:\n");
    for column in &entry.columns {
        let _ = writeln!(prompt, "- {}: {}{}", column.name, column.data_type, column.key_annotations());
    }
    let links: Vec<String> = entry
        .foreign_keys()
        .filter_map(|c| c.references.as_ref().map(|r| format!("{}.{} -> {}", entry.name, c.name, r)))
        .collect();
    if !links.is_empty() {
        let _ = writeln!(prompt, "Foreign keys: {}", links.join(", "));
    }
    prompt.push('\n');
}

/// Renders a model response in the format the prompt asks for.
pub fn render_response(reasoning: &str, sql: &str) -> String {
    format!("{} {}\n{}\n```sql\n{}\n```", REASONING_LABEL, reasoning.trim(), SQL_LABEL, sql.trim())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ColumnDescriptor, SchemaEntry};

    fn retrieved() -> Vec<ScoredEntry> {
        vec![
            ScoredEntry {
                entry: SchemaEntry::new(
                    "users",
                    vec![
                        ColumnDescriptor::new("id", "INTEGER").primary_key(),
                        ColumnDescriptor::new("created_at", "TIMESTAMP"),
                    ],
                ),
                score: 0.91,
            },
            ScoredEntry {
                entry: SchemaEntry::new(
                    "orders",
                    vec![
                        ColumnDescriptor::new("id", "INTEGER").primary_key(),
                        ColumnDescriptor::new("user_id", "INTEGER").foreign_key("users", "id"),
                    ],
                ),
                score: 0.42,
            },
        ]
    }

    #[test]
    fn test_build_is_deterministic() {
        let builder = PromptBuilder::new().with_dialect("PostgreSQL");
        let a = builder.build("How many users?", &retrieved());
        let b = builder.build("How many users?", &retrieved());
        assert_eq!(a, b);
    }

    #[test]
    fn test_golden_schema_block() {
        let prompt = PromptBuilder::new().build("How many users?", &retrieved());
        let expected = "Database schema:\n\n\
            Table: users\n\
            Columns:\n\
            - id: INTEGER (PK)\n\
            - created_at: TIMESTAMP\n\
            \n\
            Table: orders\n\
            Columns:\n\
            - id: INTEGER (PK)\n\
            - user_id: INTEGER (FK -> users.id)\n\
            Foreign keys: orders.user_id -> users.id\n\
            \n\
            Question: How many users?\n";
        assert!(prompt.contains(expected), "prompt was:\n{}", prompt);
    }

    #[test]
    fn test_instructions_present() {
        let prompt = PromptBuilder::new().build("q", &retrieved());
        assert!(prompt.contains("explain your reasoning"));
        assert!(prompt.contains("exactly one SQL statement"));
        assert!(prompt.contains("Use only the tables"));
        assert!(prompt.contains(REASONING_LABEL));
        assert!(prompt.contains(SQL_LABEL));
    }

    #[test]
    fn test_dialect_line_is_optional() {
        assert!(!PromptBuilder::new().build("q", &[]).contains("Target SQL dialect"));
        assert!(PromptBuilder::new()
            .with_dialect("SQLite")
            .build("q", &[])
            .contains("Target SQL dialect: SQLite."));
    }

    #[test]
    fn test_repair_prompt_carries_failure() {
        let prompt = PromptBuilder::new().build_repair(
            "How many users?",
            &retrieved(),
            "SELECT COUNT(*) FROM user",
            "relation \"user\" does not exist",
        );
        assert!(prompt.contains("SELECT COUNT(*) FROM user\n```"));
        assert!(prompt.contains("relation \"user\" does not exist"));
        assert!(prompt.contains("Table: orders"));
    }

    #[test]
    fn test_render_response_format() {
        assert_eq!(
            render_response("Count rows.", "SELECT 1"),
            "Reasoning: Count rows.\nSQL:\n```sql\nSELECT 1\n```"
        );
    }
}
