use crate::chains::Chain;
use crate::error::{EngineError, FailureKind};
use crate::metrics::RunMetricsSnapshot;
use crate::protocol_adapter::AdapterMetadata;
use serde::Serialize;
use uuid::Uuid;

/// Outcome of one unit of work: one operation on one adapter.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome<T> {
    Success { payload: T },
    Failure { kind: FailureKind, message: String },
}

/// A [`TaskOutcome`] with the identity of the unit that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult<T> {
    pub protocol_id: String,
    pub product_id: String,
    pub chain: Chain,
    #[serde(flatten)]
    pub outcome: TaskOutcome<T>,
}

impl<T> TaskResult<T> {
    pub fn success(metadata: &AdapterMetadata, payload: T) -> Self {
        Self {
            protocol_id: metadata.protocol_id.clone(),
            product_id: metadata.product_id.clone(),
            chain: metadata.chain,
            outcome: TaskOutcome::Success { payload },
        }
    }

    pub fn failure(metadata: &AdapterMetadata, error: &EngineError) -> Self {
        Self::failure_with_kind(metadata, error.kind(), error.to_string())
    }

    pub fn failure_with_kind(metadata: &AdapterMetadata, kind: FailureKind, message: String) -> Self {
        Self {
            protocol_id: metadata.protocol_id.clone(),
            product_id: metadata.product_id.clone(),
            chain: metadata.chain,
            outcome: TaskOutcome::Failure { kind, message },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TaskOutcome::Success { .. })
    }

    pub fn payload(&self) -> Option<&T> {
        match &self.outcome {
            TaskOutcome::Success { payload } => Some(payload),
            TaskOutcome::Failure { .. } => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> TaskResult<U> {
        let outcome = match self.outcome {
            TaskOutcome::Success { payload } => TaskOutcome::Success { payload: f(payload) },
            TaskOutcome::Failure { kind, message } => TaskOutcome::Failure { kind, message },
        };
        TaskResult {
            protocol_id: self.protocol_id,
            product_id: self.product_id,
            chain: self.chain,
            outcome,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.outcome {
            TaskOutcome::Success { .. } => None,
            TaskOutcome::Failure { kind, .. } => Some(*kind),
        }
    }
}

/// Everything one orchestration run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport<T> {
    pub run_id: Uuid,
    pub results: Vec<TaskResult<T>>,
    pub metrics: RunMetricsSnapshot,
}

impl<T> RunReport<T> {
    pub fn map<U>(self, f: impl Fn(T) -> U) -> RunReport<U> {
        RunReport {
            run_id: self.run_id,
            results: self.results.into_iter().map(|r| r.map(&f)).collect(),
            metrics: self.metrics,
        }
    }

    pub fn successes(&self) -> impl Iterator<Item = &TaskResult<T>> {
        self.results.iter().filter(|r| r.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &TaskResult<T>> {
        self.results.iter().filter(|r| !r.is_success())
    }
}
