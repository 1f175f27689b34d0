//! Scripted backends for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use repoqa_shared::{
    AnalysisRequest, AnalysisResponse, AnalysisTask, BackendError, LanguageBackend,
    SearchBackend, SearchHit, SearchMode, SearchParams,
};

/// Language backend answering from per-task queues. The last queued answer
/// for a task repeats.
#[derive(Default)]
pub(crate) struct ScriptedLanguage {
    answers: Mutex<HashMap<AnalysisTask, VecDeque<Result<Value, BackendError>>>>,
    delays: HashMap<AnalysisTask, Duration>,
    calls: Mutex<HashMap<AnalysisTask, usize>>,
    prompts: Mutex<Vec<(AnalysisTask, String)>>,
}

impl ScriptedLanguage {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn answer(self, task: AnalysisTask, value: Value) -> Self {
        self.push(task, Ok(value))
    }

    pub(crate) fn fail(self, task: AnalysisTask, error: BackendError) -> Self {
        self.push(task, Err(error))
    }

    pub(crate) fn delay(mut self, task: AnalysisTask, delay: Duration) -> Self {
        self.delays.insert(task, delay);
        self
    }

    fn push(self, task: AnalysisTask, answer: Result<Value, BackendError>) -> Self {
        self.answers
            .lock()
            .expect("answers lock")
            .entry(task)
            .or_default()
            .push_back(answer);
        self
    }

    pub(crate) fn calls(&self, task: AnalysisTask) -> usize {
        self.calls
            .lock()
            .expect("calls lock")
            .get(&task)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn total_calls(&self) -> usize {
        self.calls.lock().expect("calls lock").values().sum()
    }

    pub(crate) fn prompts(&self, task: AnalysisTask) -> Vec<String> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .iter()
            .filter(|(t, _)| *t == task)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl LanguageBackend for ScriptedLanguage {
    async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResponse, BackendError> {
        *self
            .calls
            .lock()
            .expect("calls lock")
            .entry(request.task)
            .or_default() += 1;
        self.prompts
            .lock()
            .expect("prompts lock")
            .push((request.task, request.prompt.clone()));

        if let Some(delay) = self.delays.get(&request.task) {
            tokio::time::sleep(*delay).await;
        }

        let answer = {
            let mut answers = self.answers.lock().expect("answers lock");
            let queue = answers.entry(request.task).or_default();
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        };

        match answer {
            Some(Ok(value)) => Ok(AnalysisResponse {
                value,
                tokens_used: Some(10),
            }),
            Some(Err(e)) => Err(e),
            None => Err(BackendError::Unavailable(format!(
                "no scripted answer for {}",
                request.task.as_str()
            ))),
        }
    }
}

/// Search backend with fixed hits, failures and latencies per repository.
#[derive(Default)]
pub(crate) struct ScriptedSearch {
    hits: HashMap<(String, SearchMode), Vec<SearchHit>>,
    failures: HashMap<String, BackendError>,
    delays: HashMap<(String, SearchMode), Duration>,
    repositories: Vec<String>,
    calls: AtomicUsize,
    per_repository: Mutex<HashMap<String, usize>>,
}

impl ScriptedSearch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn hits(mut self, repository: &str, mode: SearchMode, hits: Vec<SearchHit>) -> Self {
        self.register(repository);
        self.hits.insert((repository.to_string(), mode), hits);
        self
    }

    pub(crate) fn failing(mut self, repository: &str, error: BackendError) -> Self {
        self.register(repository);
        self.failures.insert(repository.to_string(), error);
        self
    }

    /// Sleep for `delay` before answering `mode` searches of `repository`.
    pub(crate) fn delay(mut self, repository: &str, mode: SearchMode, delay: Duration) -> Self {
        self.register(repository);
        self.delays.insert((repository.to_string(), mode), delay);
        self
    }

    fn register(&mut self, repository: &str) {
        if !self.repositories.iter().any(|r| r == repository) {
            self.repositories.push(repository.to_string());
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn calls_for(&self, repository: &str) -> usize {
        self.per_repository
            .lock()
            .expect("calls lock")
            .get(repository)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl SearchBackend for ScriptedSearch {
    async fn search(
        &self,
        repository: &str,
        _query: &str,
        mode: SearchMode,
        _params: &SearchParams,
    ) -> Result<Vec<SearchHit>, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self
            .per_repository
            .lock()
            .expect("calls lock")
            .entry(repository.to_string())
            .or_default() += 1;

        if let Some(delay) = self.delays.get(&(repository.to_string(), mode)) {
            tokio::time::sleep(*delay).await;
        }
        if let Some(error) = self.failures.get(repository) {
            return Err(error.clone());
        }
        Ok(self
            .hits
            .get(&(repository.to_string(), mode))
            .cloned()
            .unwrap_or_default())
    }

    async fn repositories(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.repositories.clone())
    }
}

/// Build a search hit.
pub(crate) fn hit(repository: &str, filepath: &str, score: f64) -> SearchHit {
    SearchHit {
        repository: repository.into(),
        filepath: filepath.into(),
        filename: filepath.rsplit('/').next().unwrap_or(filepath).into(),
        content: format!("contents of {filepath}"),
        relevance_score: score,
    }
}
