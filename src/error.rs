use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("task graph contains dependency cycles: {}", .path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("invalid graph state: {0}")]
    InvalidGraphState(String),

    #[error("task queue exhausted (capacity {capacity})")]
    QueueExhausted { capacity: usize },

    #[error("task \"{task}\" exceeded its retry budget of {budget}")]
    TaskRetryBudgetExceeded { task: String, budget: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
