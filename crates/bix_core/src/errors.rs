use thiserror::Error;

#[derive(Debug, Error)]
pub enum BixError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("Persist: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error("Bad magic or version")]
    BadHeader,

    #[error("Corrupt {what}: {detail}")]
    Decode { what: &'static str, detail: String },

    #[error("Duplicate value {value} for attribute '{attribute}' in one generation")]
    DuplicateValue { attribute: String, value: String },

    #[error("index problem on attribute '{attribute}': {source}")]
    IndexProblem {
        attribute: String,
        #[source]
        source: Box<BixError>,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error at {pos}: {msg}")]
    Parse { pos: usize, msg: String },
}

impl BixError {
    pub(crate) fn decode(what: &'static str, detail: impl Into<String>) -> Self {
        BixError::Decode { what, detail: detail.into() }
    }

    /// Wrap a read-path error with the attribute it happened on.
    pub(crate) fn on_attribute(self, attribute: &str) -> Self {
        match self {
            e @ BixError::IndexProblem { .. } => e,
            e => BixError::IndexProblem { attribute: attribute.to_string(), source: Box::new(e) },
        }
    }
}

pub type Result<T> = std::result::Result<T, BixError>;
