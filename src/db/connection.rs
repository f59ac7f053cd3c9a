//! Database connection management
//!
//! Database profiles come from a JSON file (`databases.json`). Backends, and
//! with them the PostgreSQL pools, are built on first use and then shared.

use crate::db::{PostgresBackend, SqlBackend, SqliteBackend};
use crate::error::{Result, Text2SqlError};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    #[serde(alias = "postgresql")]
    Postgres,
    #[serde(alias = "sqlite3")]
    Sqlite,
}

impl DatabaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseKind::Postgres => "postgres",
            DatabaseKind::Sqlite => "sqlite",
        }
    }
}

fn default_schema() -> String {
    "public".to_string()
}

/// One configured target database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseProfile {
    pub id: String,
    pub name: String,
    pub kind: DatabaseKind,
    /// Connection URL or file path; may carry credentials, so never serialized.
    #[serde(default, skip_serializing)]
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    /// PostgreSQL schema to introspect.
    #[serde(default = "default_schema")]
    pub schema: String,
}

impl DatabaseProfile {
    pub fn new(id: impl Into<String>, kind: DatabaseKind, url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            url: url.into(),
            description: None,
            schema: default_schema(),
        }
    }
}

#[derive(Default)]
pub struct DatabaseRegistry {
    profiles: Vec<DatabaseProfile>,
    backends: DashMap<String, Arc<dyn SqlBackend>>,
}

impl DatabaseRegistry {
    pub fn new(profiles: Vec<DatabaseProfile>) -> Self {
        Self {
            profiles,
            backends: DashMap::new(),
        }
    }

    /// Loads profiles from a JSON array; a missing file is an empty registry.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Database config file {} not found, no databases configured", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let profiles: Vec<DatabaseProfile> = serde_json::from_str(&content).map_err(|e| {
            Text2SqlError::Config(format!("invalid database config file {}: {}", path.display(), e))
        })?;
        info!("Loaded {} database profile(s) from {}", profiles.len(), path.display());
        Ok(Self::new(profiles))
    }

    /// Adds (or replaces) a profile together with a ready backend.
    pub fn register(&mut self, profile: DatabaseProfile, backend: Arc<dyn SqlBackend>) {
        self.backends.insert(profile.id.clone(), backend);
        match self.profiles.iter_mut().find(|p| p.id == profile.id) {
            Some(existing) => *existing = profile,
            None => self.profiles.push(profile),
        }
    }

    pub fn profiles(&self) -> &[DatabaseProfile] {
        &self.profiles
    }

    pub fn profile(&self, database_id: &str) -> Result<&DatabaseProfile> {
        self.profiles
            .iter()
            .find(|p| p.id == database_id)
            .ok_or_else(|| Text2SqlError::DatabaseNotFound(database_id.to_string()))
    }

    /// Id of the first configured database.
    pub fn default_database_id(&self) -> Option<&str> {
        self.profiles.first().map(|p| p.id.as_str())
    }

    pub fn backend(&self, database_id: &str) -> Result<Arc<dyn SqlBackend>> {
        if let Some(backend) = self.backends.get(database_id) {
            return Ok(Arc::clone(backend.value()));
        }
        let profile = self.profile(database_id)?;
        let backend: Arc<dyn SqlBackend> = match profile.kind {
            DatabaseKind::Postgres => Arc::new(PostgresBackend::connect_lazy(&profile.url, &profile.schema)?),
            DatabaseKind::Sqlite => Arc::new(SqliteBackend::new(&profile.url)),
        };
        info!("Created {} backend for database '{}'", backend.dialect(), database_id);
        // another task may have raced us here; keep whichever landed first
        let entry = self.backends.entry(database_id.to_string()).or_insert(backend);
        Ok(Arc::clone(entry.value()))
    }
}
