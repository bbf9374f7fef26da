#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A field name that is not part of a definition.
    #[error("{definition} has no field '{field}'")]
    UnknownField { definition: String, field: String },

    #[error("{type_name} expected {expected}, got {got}")]
    TypeMismatch {
        type_name: String,
        expected: String,
        got: String,
    },

    /// Enumeration, dictionary, or command name lookup miss.
    #[error("Unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("{0}")]
    OutOfRange(String),

    #[error("Invalid array spec: {0}")]
    InvalidArraySpec(String),

    #[error("Malformed table: {0}")]
    MalformedTable(String),

    #[error("Not enough bytes")]
    NotEnoughData { actual: usize, minimum: usize },

    #[error("Argument \"{0}\" is missing")]
    MissingArgument(String),

    /// Structural problems detected while building definitions.
    #[error("Invalid schema: {0}")]
    Schema(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("No {0} dictionary bound")]
    UnboundDictionary(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
