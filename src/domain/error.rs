//! Domain error types.

/// A compile error with position information for formula parsing.
#[derive(Debug, Clone, thiserror::Error)]
#[error("compile error at position {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    /// Format the error with a caret pointing at the error position in the input.
    pub fn display_with_context(&self, input: &str) -> String {
        let caret = " ".repeat(self.position) + "^";
        format!(
            "{input}\n{caret}\n{err}",
            input = input,
            caret = caret,
            err = self
        )
    }
}

/// Top-level error type for alphaloop.
#[derive(Debug, thiserror::Error)]
pub enum AlphaloopError {
    #[error(transparent)]
    Compile(#[from] ParseError),

    #[error("evaluation error: {reason}")]
    Evaluation { reason: String },

    #[error("cannot size {instrument}: {reason}")]
    Sizing { instrument: String, reason: String },

    #[error("order for {instrument} rejected: {reason}")]
    Order { instrument: String, reason: String },

    #[error("run initialization failed: {reason}")]
    Initialization { reason: String },

    #[error("transient broker failure: {reason}")]
    TransientInfra { reason: String },

    #[error("run store error: {reason}")]
    Store { reason: String },

    #[error("no run with id {id}")]
    RunNotFound { id: i64 },

    #[error("run {id} is not running")]
    RunNotActive { id: i64 },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AlphaloopError {
    /// A broker failure that should abort only the current iteration.
    pub fn is_transient(&self) -> bool {
        matches!(self, AlphaloopError::TransientInfra { .. })
    }
}

impl From<&AlphaloopError> for std::process::ExitCode {
    fn from(err: &AlphaloopError) -> Self {
        let code: u8 = match err {
            AlphaloopError::Io(_) => 1,
            AlphaloopError::ConfigParse { .. }
            | AlphaloopError::ConfigMissing { .. }
            | AlphaloopError::ConfigInvalid { .. } => 2,
            AlphaloopError::Store { .. } => 3,
            AlphaloopError::Compile(_) | AlphaloopError::Evaluation { .. } => 4,
            AlphaloopError::Initialization { .. }
            | AlphaloopError::RunNotFound { .. }
            | AlphaloopError::RunNotActive { .. } => 5,
            AlphaloopError::Sizing { .. }
            | AlphaloopError::Order { .. }
            | AlphaloopError::TransientInfra { .. } => 6,
        };
        std::process::ExitCode::from(code)
    }
}
