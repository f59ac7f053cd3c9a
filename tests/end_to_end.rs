use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use text2sql_rag::db::{DatabaseKind, DatabaseProfile, DatabaseRegistry, RowSet, SqlBackend};
use text2sql_rag::error::{ProviderError, Result as LibResult};
use text2sql_rag::execution::ExecutionOutcome;
use text2sql_rag::llm::{BackoffPolicy, InMemoryLlmConfigStore, LlmGateway, LlmProfile, MockProvider};
use text2sql_rag::metadata::{ColumnDescriptor, SchemaEntry};
use text2sql_rag::safety_guardrails::Verdict;
use text2sql_rag::schema_rag::{Embedding, EmbeddingProvider, ModelStatus, RetrievalEngine, SchemaIndex};
use text2sql_rag::Text2SqlPipeline;

const SIGNUPS_SQL: &str = "SELECT COUNT(*) FROM users WHERE created_at >= date_trunc('month', now())";

/// Backend that serves a fixed schema and answers every statement with one count.
#[derive(Default)]
struct CountingBackend {
    calls: AtomicUsize,
    statements: Mutex<Vec<String>>,
}

impl CountingBackend {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SqlBackend for CountingBackend {
    fn dialect(&self) -> &str {
        "PostgreSQL"
    }

    async fn introspect(&self) -> LibResult<Vec<SchemaEntry>> {
        Ok(vec![
            SchemaEntry::new(
                "users",
                vec![
                    ColumnDescriptor::new("id", "integer").primary_key(),
                    ColumnDescriptor::new("email", "text"),
                    ColumnDescriptor::new("created_at", "timestamp"),
                ],
            ),
            SchemaEntry::new(
                "products",
                vec![
                    ColumnDescriptor::new("id", "integer").primary_key(),
                    ColumnDescriptor::new("title", "text"),
                ],
            ),
        ])
    }

    async fn fetch(&self, sql: &str, _max_rows: usize, _timeout: Duration) -> Result<RowSet, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.statements.lock().unwrap().push(sql.to_string());
        Ok(RowSet {
            columns: vec!["count".to_string()],
            rows: vec![vec![json!(3)]],
            truncated: false,
        })
    }
}

/// Two-dimensional embedding: anything mentioning users points one way,
/// everything else the other.
struct KeywordEmbedder;

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn model_id(&self) -> &str {
        "keyword-test"
    }

    async fn embed(&self, text: &str) -> LibResult<Embedding> {
        if text.to_lowercase().contains("users") {
            Ok(vec![1.0, 0.0])
        } else {
            Ok(vec![0.0, 1.0])
        }
    }
}

fn pipeline(mock: Arc<MockProvider>, backend: Arc<CountingBackend>) -> Text2SqlPipeline {
    let mut registry = DatabaseRegistry::default();
    registry.register(DatabaseProfile::new("app", DatabaseKind::Postgres, ""), backend);

    let gateway = LlmGateway::new(
        BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
            jitter: false,
        },
        Duration::from_secs(5),
    );
    gateway.register("local", mock);

    Text2SqlPipeline::new(
        Arc::new(registry),
        RetrievalEngine::new(SchemaIndex::new(), Arc::new(KeywordEmbedder), ModelStatus::ready()),
        Arc::new(InMemoryLlmConfigStore::new(vec![LlmProfile::local()])),
        Arc::new(gateway),
    )
}

#[tokio::test]
async fn test_signup_count_produces_full_trace() -> Result<(), Box<dyn std::error::Error>> {
    let mock = Arc::new(MockProvider::answering(
        "Sign-ups are rows in users; count those created since the start of this month.",
        SIGNUPS_SQL,
    ));
    let backend = Arc::new(CountingBackend::default());
    let pipeline = pipeline(mock.clone(), backend.clone());

    let response = pipeline
        .process_query("How many users signed up this month?", "app", None, true)
        .await;

    assert!(response.success, "unexpected error: {:?}", response.error);
    let trace = &response.trace;
    assert_eq!(trace.retrieval[0].entry.name, "users");
    assert!(trace.retrieval.windows(2).all(|w| w[0].score >= w[1].score));
    assert!(!trace.reasoning().unwrap_or_default().is_empty());
    assert_eq!(trace.extracted_sql(), Some(SIGNUPS_SQL));
    assert_eq!(trace.verdict, Some(Verdict::Allowed));
    match &trace.outcome {
        Some(ExecutionOutcome::Success {
            columns,
            rows,
            row_count,
            ..
        }) => {
            assert_eq!(columns, &vec!["count".to_string()]);
            assert_eq!(rows, &vec![vec![json!(3)]]);
            assert_eq!(*row_count, 1);
        }
        other => panic!("expected a successful outcome, got {:?}", other),
    }

    assert_eq!(backend.calls(), 1);
    assert_eq!(backend.statements.lock().unwrap()[0], SIGNUPS_SQL);
    let prompt = &mock.prompts()[0];
    assert!(prompt.contains("Table: users"));
    assert!(prompt.contains("- id: integer (PK)"));
    assert!(prompt.contains("Target SQL dialect: PostgreSQL."));
    Ok(())
}

#[tokio::test]
async fn test_prose_only_answer_is_not_fatal() -> Result<(), Box<dyn std::error::Error>> {
    let mock = Arc::new(MockProvider::scripted(vec![Ok(
        "I could not tell which table records sign-ups. Could you name it?".to_string(),
    )]));
    let backend = Arc::new(CountingBackend::default());
    let pipeline = pipeline(mock, backend.clone());

    let response = pipeline
        .process_query("How many users signed up this month?", "app", None, true)
        .await;

    assert!(!response.success);
    assert!(response.sql.is_none());
    assert!(response.result.is_none());
    assert!(response.trace.extracted_sql().is_none());
    assert!(response.trace.outcome.is_none());
    assert!(response.trace.generation.is_some());
    assert_eq!(response.error.as_deref(), Some("no SQL statement found in model response"));
    assert_eq!(backend.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_drop_table_is_blocked_before_execution() -> Result<(), Box<dyn std::error::Error>> {
    let mock = Arc::new(MockProvider::scripted(vec![Ok(
        "Reasoning: The request is to remove the users table.\nSQL:\nDROP TABLE users;".to_string(),
    )]));
    let backend = Arc::new(CountingBackend::default());
    let pipeline = pipeline(mock, backend.clone());

    let response = pipeline.process_query("Delete all the users", "app", None, true).await;

    assert!(!response.success);
    assert!(response.sql.as_deref().unwrap_or_default().contains("DROP TABLE users"));
    assert!(matches!(response.trace.verdict, Some(Verdict::Blocked { .. })));
    match &response.trace.outcome {
        Some(ExecutionOutcome::Blocked { reason }) => assert!(!reason.is_empty()),
        other => panic!("expected a blocked outcome, got {:?}", other),
    }
    assert_eq!(backend.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_transient_provider_failures_are_retried() -> Result<(), Box<dyn std::error::Error>> {
    let mock = Arc::new(MockProvider::scripted(vec![
        Err(ProviderError::Transient("429 rate limited".to_string())),
        Err(ProviderError::Transient("503 unavailable".to_string())),
        Ok("Reasoning: count users\nSQL: SELECT COUNT(*) FROM users".to_string()),
    ]));
    let backend = Arc::new(CountingBackend::default());
    let pipeline = pipeline(mock.clone(), backend.clone());

    let response = pipeline.process_query("How many users?", "app", None, false).await;

    assert!(response.success, "unexpected error: {:?}", response.error);
    assert_eq!(response.sql.as_deref(), Some("SELECT COUNT(*) FROM users"));
    assert_eq!(mock.calls(), 3);
    assert_eq!(backend.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_every_query_lands_in_history() -> Result<(), Box<dyn std::error::Error>> {
    let backend = Arc::new(CountingBackend::default());
    let pipeline = pipeline(Arc::new(MockProvider::new()), backend);

    let first = pipeline.process_query("list users", "app", None, false).await;
    let second = pipeline.process_query("list products", "app", None, false).await;

    let recent = pipeline.traces().recent(10);
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].id, second.trace.id);
    assert_eq!(recent[1].id, first.trace.id);
    assert_eq!(
        pipeline.traces().get(&first.trace.id).map(|t| t.question),
        Some("list users".to_string())
    );
    Ok(())
}
