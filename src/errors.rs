use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("{message}")]
    Launch { message: String },

    #[error("{program} exited (code {code}): {diagnostics}")]
    EarlyExit {
        program: String,
        code: String,
        diagnostics: String,
    },

    #[error("{program} started but produced no frames within {secs}s. stderr: {diagnostics}")]
    NoFrames {
        program: String,
        secs: u64,
        diagnostics: String,
    },

    #[error("Stream active but no frame available")]
    NoFrame,

    #[error("Stream not running")]
    NotRunning,

    #[error("Stream was restarted by another request")]
    Superseded,

    #[error("{message}")]
    Capture { message: String },

    #[error("Capture timed out after {secs}s")]
    CaptureTimeout { secs: u64 },

    #[error("Camera handoff error: {message}")]
    Arbiter { message: String },

    #[error("Stream task interrupted: {message}")]
    Interrupted { message: String },

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Database error: {source}")]
    Database {
        #[from]
        source: sqlx::Error,
    },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },
}

impl StreamError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    pub fn launch(message: impl Into<String>) -> Self {
        Self::Launch { message: message.into() }
    }

    pub fn capture(message: impl Into<String>) -> Self {
        Self::Capture { message: message.into() }
    }

    pub fn arbiter(message: impl Into<String>) -> Self {
        Self::Arbiter { message: message.into() }
    }

    /// HTTP status the handlers answer with for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            StreamError::NotRunning => 400,
            StreamError::Config { .. } => 400,
            StreamError::InvalidValue { .. } => 400,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
