use thiserror::Error;

/// Failures of the cross-cluster weight store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No row exists yet for this cluster. Expected on first start.
    #[error("no weight row found for cluster {0}")]
    NotFound(String),
    /// Another writer holds a transaction on the same row.
    #[error("conflicting transaction on weight row: {0}")]
    TransactionConflict(String),
    /// The write condition did not hold (the row already exists when seeding).
    #[error("weight row condition check failed")]
    ConditionFailed,
    #[error("malformed weight row: {0}")]
    Malformed(String),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound(_)) }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::TransactionConflict(_) | Self::Backend(_))
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("cannot handle negative weight {0}")]
    NegativeWeight(f64),
    #[error("cannot parse annotation {key} with value '{value}'")]
    AnnotationParse { key: String, value: String },
    #[error("orchestration api error: {0}")]
    Orchestration(#[from] kube::Error),
    #[error("weight store error: {0}")]
    Store(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("route fan-out channel closed")]
    FanOutClosed,
}

impl Error {
    /// Transient failures worth a requeue. Weight errors only clear when the
    /// route or the store changes, so they are not retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Orchestration(_) => true,
            Self::Store(e) => e.is_retryable(),
            Self::NegativeWeight(_) | Self::AnnotationParse { .. } | Self::Config(_) | Self::FanOutClosed => false,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            Self::NegativeWeight(_) => "negative_weight",
            Self::AnnotationParse { .. } => "annotation_parse",
            Self::Orchestration(_) => "orchestration",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
            Self::FanOutClosed => "fan_out_closed",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
