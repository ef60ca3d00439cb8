use thiserror::Error;

pub type SheetResult<T> = Result<T, SheetError>;

#[derive(Error, Debug)]
pub enum SheetError {
    #[error("Unsupported formula: {0}")]
    UnsupportedFormula(String),

    #[error("{function} expects {expected}, got {actual} argument(s)")]
    Arity {
        function: String,
        expected: String,
        actual: usize,
    },

    #[error("Sheet not loaded: {0}")]
    SheetNotLoaded(String),

    #[error("Column {column} not found in sheet {sheet}")]
    ColumnNotFound { sheet: String, column: String },

    #[error("Invalid match type: {0}")]
    InvalidMatchType(String),

    #[error("Invalid range reference: {0}")]
    InvalidRangeReference(String),

    #[error("Invalid argument to {function}: {message}")]
    InvalidArgument { function: String, message: String },

    #[error("No materialized cache for column {column} in sheet {sheet}")]
    CacheNotBuilt { sheet: String, column: String },

    #[error("Aggregate '{0}' was not materialized for this cache")]
    AggregateNotMaterialized(String),

    #[error("Unsupported aggregate: {0}")]
    UnsupportedAggregate(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl SheetError {
    /// Shorthand for an arity failure on `function`
    pub fn arity(function: &str, expected: impl Into<String>, actual: usize) -> Self {
        SheetError::Arity {
            function: function.to_string(),
            expected: expected.into(),
            actual,
        }
    }

    /// Shorthand for an argument that is present but unusable
    pub fn invalid_argument(function: &str, message: impl Into<String>) -> Self {
        SheetError::InvalidArgument {
            function: function.to_string(),
            message: message.into(),
        }
    }
}
