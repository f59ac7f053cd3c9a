//! Query Trace
//!
//! The record of one question's trip through the pipeline. A `TraceRecorder`
//! collects stage timings and errors while the pipeline runs, then
//! `assemble` freezes everything into a `QueryTrace`. Inputs are kept
//! verbatim; the trace is what UIs and logs display.

use crate::execution::ExecutionOutcome;
use crate::safety_guardrails::Verdict;
use crate::schema_rag::RetrievalResult;
use crate::sql_extractor::GenerationResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryTrace {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub question: String,
    pub database_id: String,
    pub llm_config_id: Option<String>,
    pub retrieval: RetrievalResult,
    pub prompt: Option<String>,
    pub generation: Option<GenerationResponse>,
    pub verdict: Option<Verdict>,
    pub outcome: Option<ExecutionOutcome>,
    /// Messages from every stage that failed, in order.
    pub errors: Vec<String>,
    /// Stage name to wall time in milliseconds.
    pub timings_ms: BTreeMap<String, u64>,
}

impl QueryTrace {
    pub fn extracted_sql(&self) -> Option<&str> {
        self.generation.as_ref().and_then(|g| g.extracted_sql.as_deref())
    }

    pub fn reasoning(&self) -> Option<&str> {
        self.generation.as_ref().and_then(|g| g.reasoning.as_deref())
    }
}

/// Collects per-query context until the trace is assembled.
#[derive(Debug)]
pub struct TraceRecorder {
    id: Uuid,
    created_at: DateTime<Utc>,
    question: String,
    database_id: String,
    llm_config_id: Option<String>,
    prompt: Option<String>,
    errors: Vec<String>,
    stage_starts: HashMap<String, Instant>,
    timings_ms: BTreeMap<String, u64>,
}

impl TraceRecorder {
    pub fn new(question: &str, database_id: &str, llm_config_id: Option<&str>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            question: question.to_string(),
            database_id: database_id.to_string(),
            llm_config_id: llm_config_id.map(str::to_string),
            prompt: None,
            errors: Vec::new(),
            stage_starts: HashMap::new(),
            timings_ms: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn start_stage(&mut self, stage: &str) {
        self.stage_starts.insert(stage.to_string(), Instant::now());
    }

    pub fn end_stage(&mut self, stage: &str) {
        if let Some(start) = self.stage_starts.remove(stage) {
            self.timings_ms.insert(stage.to_string(), start.elapsed().as_millis() as u64);
        }
    }

    pub fn record_prompt(&mut self, prompt: &str) {
        self.prompt = Some(prompt.to_string());
    }

    pub fn record_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn assemble(
        self,
        retrieval: RetrievalResult,
        generation: Option<GenerationResponse>,
        verdict: Option<Verdict>,
        outcome: Option<ExecutionOutcome>,
    ) -> QueryTrace {
        QueryTrace {
            id: self.id,
            created_at: self.created_at,
            question: self.question,
            database_id: self.database_id,
            llm_config_id: self.llm_config_id,
            retrieval,
            prompt: self.prompt,
            generation,
            verdict,
            outcome,
            errors: self.errors,
            timings_ms: self.timings_ms,
        }
    }
}
