//! Schema metadata describing the tables of a target database.
//!
//! A `SchemaEntry` is produced by introspection and is immutable for a given
//! database snapshot; re-introspecting produces a fresh set.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Target of a foreign-key column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnReference {
    pub table: String,
    pub column: String,
}

impl fmt::Display for ColumnReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub is_foreign_key: bool,
    #[serde(default)]
    pub references: Option<ColumnReference>,
}

impl ColumnDescriptor {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            is_primary_key: false,
            is_foreign_key: false,
            references: None,
        }
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }

    pub fn foreign_key(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.is_foreign_key = true;
        self.references = Some(ColumnReference {
            table: table.into(),
            column: column.into(),
        });
        self
    }

    /// Key annotations in the form used by both embeddings and prompts,
    /// e.g. ` (PK)` or ` (FK -> orgs.id)`.
    pub fn key_annotations(&self) -> String {
        let mut out = String::new();
        if self.is_primary_key {
            out.push_str(" (PK)");
        }
        if self.is_foreign_key {
            match &self.references {
                Some(target) => out.push_str(&format!(" (FK -> {})", target)),
                None => out.push_str(" (FK)"),
            }
        }
        out
    }
}

/// One table of a target database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaEntry {
    pub name: String,
    pub columns: Vec<ColumnDescriptor>,
    /// Text submitted to the embedding model.
    pub description: String,
}

impl SchemaEntry {
    /// Builds an entry and derives its embedding description from the columns.
    pub fn new(name: impl Into<String>, columns: Vec<ColumnDescriptor>) -> Self {
        let name = name.into();
        let description = describe_table(&name, &columns);
        Self {
            name,
            columns,
            description,
        }
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn primary_keys(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.is_primary_key)
    }

    pub fn foreign_keys(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.is_foreign_key)
    }
}

fn describe_table(name: &str, columns: &[ColumnDescriptor]) -> String {
    let mut text = format!("Table: {}\nColumns:\n", name);
    for column in columns {
        text.push_str(&format!(
            "- {}: {}{}\n",
            column.name,
            column.data_type,
            column.key_annotations()
        ));
    }
    text
}
