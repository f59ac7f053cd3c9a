//! Local provider: deterministic, offline, and scriptable for tests.

use crate::error::ProviderError;
use crate::llm::LlmProvider;
use crate::prompt::render_response;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Replays scripted results in order; once the script is exhausted it
/// answers with a `SELECT` over the first table named in the prompt.
#[derive(Debug, Default)]
pub struct MockProvider {
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(responses: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            ..Self::default()
        }
    }

    /// Answers the first call with `reasoning` and `sql` in the response format.
    pub fn answering(reasoning: &str, sql: &str) -> Self {
        Self::scripted(vec![Ok(render_response(reasoning, sql))])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(prompt.to_string());

        let scripted = self.script.lock().unwrap_or_else(|p| p.into_inner()).pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(default_answer(prompt)),
        }
    }
}

fn default_answer(prompt: &str) -> String {
    let first_table = prompt
        .lines()
        .find_map(|line| line.strip_prefix("Table: "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    match first_table {
        Some(table) => render_response(
            &format!("The most relevant table is {}.", table),
            &format!("SELECT * FROM {} LIMIT 10", table),
        ),
        None => render_response("No schema was provided.", "SELECT 1 AS test"),
    }
}
