//! Text-to-SQL Pipeline
//!
//! question -> retrieval -> prompt -> generation -> extraction -> validation
//! -> execution, strictly in that order. Every stage failure is scoped to the
//! query: the caller always gets a `QueryResponse` with the full trace, and
//! the missing fields tell which stage stopped.

use crate::config::AppConfig;
use crate::db::{DatabaseProfile, DatabaseRegistry};
use crate::error::{Result, Text2SqlError};
use crate::execution::{ExecutionLimits, ExecutionOutcome, QueryExecutor};
use crate::llm::{FileLlmConfigStore, GenerationRequest, LlmConfigStore, LlmGateway, LlmProfile};
use crate::observability::{QueryTrace, TraceRecorder, TraceStore};
use crate::prompt::PromptBuilder;
use crate::safety_guardrails::{SafetyValidator, Verdict};
use crate::schema_rag::{EmbeddingModelState, ModelStatus, RetrievalEngine, RetrievalResult, SchemaIndex};
use crate::sql_extractor::{extract, GenerationResponse};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub top_k: usize,
    /// Provider-level retries for transient LLM failures.
    pub max_retries: u32,
    /// Introspect and index a database the first time it is queried, or when
    /// its index was built by another embedding model.
    pub auto_index: bool,
    pub default_llm: Option<String>,
    /// Where the schema index is persisted after every (re)index.
    pub index_file: Option<PathBuf>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            top_k: 5,
            max_retries: 3,
            auto_index: true,
            default_llm: None,
            index_file: None,
        }
    }
}

/// What `process_query` hands back to the request layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query: String,
    pub database_id: String,
    pub llm_config_id: Option<String>,
    pub sql: Option<String>,
    pub result: Option<ExecutionOutcome>,
    pub success: bool,
    pub error: Option<String>,
    pub trace: QueryTrace,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub embedding_model: String,
    pub embedding_state: EmbeddingModelState,
    pub indexed_databases: Vec<String>,
    pub configured_databases: usize,
    pub stored_traces: usize,
}

struct Attempt<'a> {
    question: &'a str,
    database_id: &'a str,
    llm_config_id: Option<&'a str>,
    execute: bool,
    /// Previous SQL and the error it produced.
    repair: Option<(&'a str, &'a str)>,
}

#[derive(Default)]
struct Artifacts {
    retrieval: RetrievalResult,
    generation: Option<GenerationResponse>,
    verdict: Option<Verdict>,
    outcome: Option<ExecutionOutcome>,
}

#[derive(Clone)]
pub struct Text2SqlPipeline {
    registry: Arc<DatabaseRegistry>,
    retrieval: RetrievalEngine,
    llm_configs: Arc<dyn LlmConfigStore>,
    gateway: Arc<LlmGateway>,
    validator: SafetyValidator,
    executor: QueryExecutor,
    traces: TraceStore,
    settings: PipelineSettings,
}

impl Text2SqlPipeline {
    pub fn new(
        registry: Arc<DatabaseRegistry>,
        retrieval: RetrievalEngine,
        llm_configs: Arc<dyn LlmConfigStore>,
        gateway: Arc<LlmGateway>,
    ) -> Self {
        Self {
            executor: QueryExecutor::new(Arc::clone(&registry), ExecutionLimits::default()),
            registry,
            retrieval,
            llm_configs,
            gateway,
            validator: SafetyValidator::default(),
            traces: TraceStore::default(),
            settings: PipelineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_validator(mut self, validator: SafetyValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.executor = QueryExecutor::new(Arc::clone(&self.registry), limits);
        self
    }

    pub fn with_trace_store(mut self, traces: TraceStore) -> Self {
        self.traces = traces;
        self
    }

    /// Wires every component from configuration files. `status` is shared with
    /// whoever warms the embedding model up.
    pub fn from_config(config: &AppConfig, status: ModelStatus) -> Result<Self> {
        let registry = Arc::new(DatabaseRegistry::from_file(&config.databases_file)?);
        let llm_configs: Arc<dyn LlmConfigStore> = Arc::new(FileLlmConfigStore::open(&config.llms_file)?);
        let index = if config.index_file.exists() {
            match SchemaIndex::load(&config.index_file) {
                Ok(index) => {
                    info!(
                        "Loaded schema index for {} database(s) from {}",
                        index.database_ids().len(),
                        config.index_file.display()
                    );
                    index
                }
                Err(e) => {
                    warn!("Ignoring unreadable schema index {}: {}", config.index_file.display(), e);
                    SchemaIndex::new()
                }
            }
        } else {
            SchemaIndex::new()
        };
        let retrieval = RetrievalEngine::new(index, config.embedder()?, status);
        let gateway = Arc::new(LlmGateway::new(config.backoff, config.llm_timeout));

        Ok(Self::new(registry, retrieval, llm_configs, gateway)
            .with_settings(PipelineSettings {
                top_k: config.top_k,
                max_retries: config.max_retries,
                auto_index: config.auto_index,
                default_llm: config.default_llm.clone(),
                index_file: Some(config.index_file.clone()),
            })
            .with_validator(SafetyValidator::new(config.safety.clone()))
            .with_limits(config.limits)
            .with_trace_store(TraceStore::new(config.history_size)))
    }

    pub fn registry(&self) -> &DatabaseRegistry {
        &self.registry
    }

    pub fn databases(&self) -> &[DatabaseProfile] {
        self.registry.profiles()
    }

    pub fn default_database_id(&self) -> Option<&str> {
        self.registry.default_database_id()
    }

    pub fn llm_profiles(&self) -> Vec<LlmProfile> {
        self.llm_configs.list()
    }

    pub fn default_llm(&self) -> Option<&str> {
        self.settings.default_llm.as_deref()
    }

    pub fn retrieval(&self) -> &RetrievalEngine {
        &self.retrieval
    }

    pub fn traces(&self) -> &TraceStore {
        &self.traces
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            embedding_model: self.retrieval.model_id().to_string(),
            embedding_state: self.retrieval.status().state(),
            indexed_databases: self.retrieval.index().database_ids(),
            configured_databases: self.registry.profiles().len(),
            stored_traces: self.traces.count(),
        }
    }

    /// Answers `question` against `database_id`. Runs the SQL only when
    /// `execute` is set.
    pub async fn process_query(
        &self,
        question: &str,
        database_id: &str,
        llm_config_id: Option<&str>,
        execute: bool,
    ) -> QueryResponse {
        self.run(Attempt {
            question,
            database_id,
            llm_config_id,
            execute,
            repair: None,
        })
        .await
    }

    /// Asks the model to correct `previous_sql` given the error it produced.
    /// Never invoked automatically.
    pub async fn repair_query(
        &self,
        question: &str,
        database_id: &str,
        llm_config_id: Option<&str>,
        previous_sql: &str,
        error_message: &str,
        execute: bool,
    ) -> QueryResponse {
        self.run(Attempt {
            question,
            database_id,
            llm_config_id,
            execute,
            repair: Some((previous_sql, error_message)),
        })
        .await
    }

    /// Introspects the database and rebuilds its index wholesale.
    pub async fn index_database(&self, database_id: &str) -> Result<usize> {
        let backend = self.registry.backend(database_id)?;
        let entries = backend.introspect().await?;
        let count = self.retrieval.index_database(database_id, entries).await?;
        info!(
            "Indexed {} table(s) of '{}' with {}",
            count,
            database_id,
            self.retrieval.model_id()
        );
        if let Some(path) = self.settings.index_file.clone() {
            let index = self.retrieval.index().clone();
            tokio::task::spawn_blocking(move || index.save(path))
                .await
                .map_err(std::io::Error::from)??;
        }
        Ok(count)
    }

    async fn run(&self, attempt: Attempt<'_>) -> QueryResponse {
        let llm_config_id = attempt
            .llm_config_id
            .map(str::to_string)
            .or_else(|| self.settings.default_llm.clone());
        let mut recorder = TraceRecorder::new(attempt.question, attempt.database_id, llm_config_id.as_deref());
        let mut artifacts = Artifacts::default();
        info!(
            "Processing question {} for database '{}': {}",
            recorder.id(),
            attempt.database_id,
            attempt.question
        );

        if let Err(e) = self
            .drive(&attempt, llm_config_id.as_deref(), &mut recorder, &mut artifacts)
            .await
        {
            warn!("Question {} stopped: {}", recorder.id(), e);
            recorder.record_error(e.to_string());
        }

        let error = recorder.errors().first().cloned();
        let trace = recorder.assemble(
            artifacts.retrieval,
            artifacts.generation,
            artifacts.verdict,
            artifacts.outcome.clone(),
        );
        self.traces.store(trace.clone());

        QueryResponse {
            query: attempt.question.to_string(),
            database_id: attempt.database_id.to_string(),
            llm_config_id,
            sql: trace.extracted_sql().map(str::to_string),
            result: artifacts.outcome,
            success: error.is_none(),
            error,
            trace,
        }
    }

    async fn drive(
        &self,
        attempt: &Attempt<'_>,
        llm_config_id: Option<&str>,
        recorder: &mut TraceRecorder,
        artifacts: &mut Artifacts,
    ) -> Result<()> {
        if attempt.question.trim().is_empty() {
            return Err(Text2SqlError::InvalidRequest("question must not be empty".to_string()));
        }
        self.registry.profile(attempt.database_id)?;

        recorder.start_stage("retrieval");
        let retrieved = self.retrieve(attempt.database_id, attempt.question).await;
        recorder.end_stage("retrieval");
        artifacts.retrieval = retrieved?;

        recorder.start_stage("prompt");
        let builder = self.prompt_builder(attempt.database_id);
        let prompt = match attempt.repair {
            Some((previous_sql, error_message)) => {
                builder.build_repair(attempt.question, &artifacts.retrieval, previous_sql, error_message)
            }
            None => builder.build(attempt.question, &artifacts.retrieval),
        };
        recorder.record_prompt(&prompt);
        recorder.end_stage("prompt");

        // no id: the store falls back to its first profile
        let profile = self.llm_configs.get(llm_config_id.unwrap_or_default())?;
        recorder.start_stage("generation");
        let raw = self
            .gateway
            .generate(&GenerationRequest {
                provider: profile,
                prompt,
                max_retries: self.settings.max_retries,
            })
            .await;
        recorder.end_stage("generation");

        let generation = extract(&raw?);
        let sql = generation.extracted_sql.clone();
        artifacts.generation = Some(generation);
        let sql = sql.ok_or(Text2SqlError::NoSqlFound)?;
        info!("Extracted SQL: {}", sql);

        recorder.start_stage("validation");
        let verdict = self.validator.validate(&sql);
        recorder.end_stage("validation");
        artifacts.verdict = Some(verdict.clone());
        if let Verdict::Blocked { reason } = verdict {
            artifacts.outcome = Some(ExecutionOutcome::Blocked { reason: reason.clone() });
            return Err(Text2SqlError::Blocked(reason));
        }
        if !attempt.execute {
            return Ok(());
        }

        recorder.start_stage("execution");
        let outcome = self.executor.execute(attempt.database_id, &sql).await;
        recorder.end_stage("execution");
        if let ExecutionOutcome::Failed { error_message } = &outcome {
            recorder.record_error(Text2SqlError::ExecutionFailed(error_message.clone()).to_string());
        }
        artifacts.outcome = Some(outcome);
        Ok(())
    }

    async fn retrieve(&self, database_id: &str, question: &str) -> Result<RetrievalResult> {
        match self.retrieval.retrieve(database_id, question, self.settings.top_k).await {
            Err(e @ (Text2SqlError::IndexNotFound(_) | Text2SqlError::IndexStale { .. })) if self.settings.auto_index => {
                info!("{}; indexing '{}' now", e, database_id);
                self.index_database(database_id).await?;
                self.retrieval.retrieve(database_id, question, self.settings.top_k).await
            }
            other => other,
        }
    }

    fn prompt_builder(&self, database_id: &str) -> PromptBuilder {
        match self.registry.backend(database_id) {
            Ok(backend) => PromptBuilder::new().with_dialect(backend.dialect()),
            Err(_) => PromptBuilder::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseKind;
    use crate::error::ProviderError;
    use crate::llm::{InMemoryLlmConfigStore, MockProvider};
    use crate::schema_rag::HashingEmbedder;
    use rusqlite::Connection;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        pipeline: Text2SqlPipeline,
        mock: Arc<MockProvider>,
    }

    fn fixture(mock: MockProvider, settings: PipelineSettings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT, created_at TEXT);
             CREATE TABLE orders (id INTEGER PRIMARY KEY, user_id INTEGER REFERENCES users(id), total REAL);
             INSERT INTO users (email, created_at) VALUES
                ('a@example.com', '2024-01-02'), ('b@example.com', '2024-01-05'), ('c@example.com', '2024-02-01');",
        )
        .unwrap();

        let registry = Arc::new(DatabaseRegistry::new(vec![DatabaseProfile::new(
            "shop",
            DatabaseKind::Sqlite,
            path.to_str().unwrap(),
        )]));
        let retrieval = RetrievalEngine::new(
            SchemaIndex::new(),
            Arc::new(HashingEmbedder::default()),
            ModelStatus::ready(),
        );
        let gateway = Arc::new(LlmGateway::new(
            crate::llm::BackoffPolicy {
                base: Duration::from_millis(1),
                max: Duration::from_millis(2),
                jitter: false,
            },
            Duration::from_secs(5),
        ));
        let mock = Arc::new(mock);
        gateway.register("local", mock.clone());
        let pipeline = Text2SqlPipeline::new(
            registry,
            retrieval,
            Arc::new(InMemoryLlmConfigStore::new(vec![LlmProfile::local()])),
            gateway,
        )
        .with_settings(settings);

        Fixture {
            _dir: dir,
            pipeline,
            mock,
        }
    }

    #[tokio::test]
    async fn test_first_query_indexes_and_executes() {
        let fx = fixture(
            MockProvider::answering("Count the users.", "SELECT COUNT(*) AS count FROM users"),
            PipelineSettings::default(),
        );
        let response = fx.pipeline.process_query("How many users are there?", "shop", None, true).await;

        assert!(response.success, "unexpected error: {:?}", response.error);
        assert_eq!(response.sql.as_deref(), Some("SELECT COUNT(*) AS count FROM users"));
        match response.result {
            Some(ExecutionOutcome::Success { columns, rows, row_count, .. }) => {
                assert_eq!(columns, vec!["count"]);
                assert_eq!(rows, vec![vec![serde_json::json!(3)]]);
                assert_eq!(row_count, 1);
            }
            other => panic!("expected success, got {:?}", other),
        }
        assert_eq!(response.trace.reasoning(), Some("Count the users."));
        assert!(!response.trace.retrieval.is_empty());
        assert!(response.trace.prompt.as_deref().unwrap().contains("Target SQL dialect: SQLite."));
        assert_eq!(response.trace.verdict, Some(Verdict::Allowed));
        assert!(fx.pipeline.retrieval().index().contains("shop"));
        assert_eq!(fx.pipeline.traces().count(), 1);
    }

    #[tokio::test]
    async fn test_without_auto_index_retrieval_stops_the_query() {
        let fx = fixture(
            MockProvider::new(),
            PipelineSettings {
                auto_index: false,
                ..PipelineSettings::default()
            },
        );
        let response = fx.pipeline.process_query("list users", "shop", None, true).await;

        assert!(!response.success);
        assert!(response.error.unwrap().contains("no schema index"));
        assert!(response.sql.is_none());
        assert!(response.result.is_none());
        assert_eq!(fx.mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_no_execute_returns_sql_only() {
        let fx = fixture(MockProvider::new(), PipelineSettings::default());
        let response = fx.pipeline.process_query("show me the users", "shop", None, false).await;

        assert!(response.success);
        assert!(response.sql.unwrap().starts_with("SELECT * FROM"));
        assert!(response.result.is_none());
        assert!(response.trace.outcome.is_none());
    }

    #[tokio::test]
    async fn test_execution_failure_keeps_sql_and_reasoning() {
        let fx = fixture(
            MockProvider::answering("Use the customers table.", "SELECT * FROM customers"),
            PipelineSettings::default(),
        );
        let response = fx.pipeline.process_query("list customers", "shop", None, true).await;

        assert!(!response.success);
        assert_eq!(response.sql.as_deref(), Some("SELECT * FROM customers"));
        assert_eq!(response.trace.reasoning(), Some("Use the customers table."));
        assert!(matches!(response.result, Some(ExecutionOutcome::Failed { .. })));
        assert!(response.error.unwrap().starts_with("execution failed:"));
    }

    #[tokio::test]
    async fn test_permanent_provider_error_is_reported() {
        let fx = fixture(
            MockProvider::scripted(vec![Err(ProviderError::Permanent("invalid api key".into()))]),
            PipelineSettings::default(),
        );
        let response = fx.pipeline.process_query("list users", "shop", None, true).await;

        assert!(!response.success);
        assert!(response.error.unwrap().contains("invalid api key"));
        assert!(response.trace.generation.is_none());
        assert!(response.trace.prompt.is_some());
        assert_eq!(fx.mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_repair_prompt_carries_previous_attempt() {
        let fx = fixture(
            MockProvider::answering("Fixed the table name.", "SELECT * FROM users"),
            PipelineSettings::default(),
        );
        let response = fx
            .pipeline
            .repair_query(
                "list users",
                "shop",
                Some("local"),
                "SELECT * FROM userz",
                "no such table: userz",
                true,
            )
            .await;

        assert!(response.success);
        let prompt = &fx.mock.prompts()[0];
        assert!(prompt.contains("SELECT * FROM userz"));
        assert!(prompt.contains("no such table: userz"));
    }

    #[tokio::test]
    async fn test_stale_index_is_rebuilt() {
        let fx = fixture(MockProvider::new(), PipelineSettings::default());
        let users = crate::metadata::SchemaEntry::new("ghost", Vec::new());
        fx.pipeline
            .retrieval()
            .index()
            .index("shop", "some-other-model", vec![(users, vec![1.0; 384])])
            .unwrap();

        let response = fx.pipeline.process_query("list users", "shop", None, false).await;
        assert!(response.success, "unexpected error: {:?}", response.error);
        let names: Vec<&str> = response.trace.retrieval.iter().map(|s| s.entry.name.as_str()).collect();
        assert!(names.contains(&"users"));
        assert!(!names.contains(&"ghost"));
    }

    #[tokio::test]
    async fn test_unknown_database_is_data_not_a_fault() {
        let fx = fixture(MockProvider::new(), PipelineSettings::default());
        let response = fx.pipeline.process_query("anything", "warehouse", None, true).await;
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("database 'warehouse' is not configured"));
        assert_eq!(fx.pipeline.traces().count(), 1);
    }

    #[tokio::test]
    async fn test_index_is_persisted_after_indexing() {
        let store = tempfile::tempdir().unwrap();
        let path = store.path().join("index").join("schema_index.json");
        let fx = fixture(
            MockProvider::new(),
            PipelineSettings {
                index_file: Some(path.clone()),
                ..PipelineSettings::default()
            },
        );

        fx.pipeline.index_database("shop").await.unwrap();

        let loaded = SchemaIndex::load(&path).unwrap();
        assert_eq!(loaded.get("shop").unwrap().entries.len(), 2);
    }

    #[tokio::test]
    async fn test_status_reports_indexed_databases() {
        let fx = fixture(MockProvider::new(), PipelineSettings::default());
        assert_eq!(fx.pipeline.index_database("shop").await.unwrap(), 2);
        let status = fx.pipeline.status();
        assert_eq!(status.embedding_state, EmbeddingModelState::Ready);
        assert_eq!(status.indexed_databases, vec!["shop"]);
        assert_eq!(status.configured_databases, 1);
    }
}
