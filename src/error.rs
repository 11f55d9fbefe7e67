//! Structured error types for the eSIM toolkit.
//!
//! Every public library function returns [`Result<T>`] which carries a
//! domain-specific [`EsimError`].  Callers that only need the category (for
//! example to pick a message template or an exit code) use
//! [`EsimError::kind`]; the text meant for an end user is [`EsimError::reason`].

use thiserror::Error;

// ---------------------------------------------------------------------------
// Primary error enum
// ---------------------------------------------------------------------------

/// Domain-specific error type for the eSIM toolkit.
#[derive(Error, Debug)]
pub enum EsimError {
    /// Input does not match the LPA activation grammar.
    #[error("format: {0}")]
    Format(String),

    /// A field is well-formed but semantically invalid.
    #[error("validation: {0}")]
    Validation(String),

    /// No machine-readable symbol could be read from an image.
    #[error("decode: {0}")]
    Decode(String),

    /// I/O failure on a persisted entity (inventory table, session cache).
    #[error("storage: {0}")]
    Storage(String),

    /// Network failure or timeout against the fulfillment API.
    #[error("connectivity: {0}")]
    Connectivity(String),

    /// Login or refresh rejected by the provider.
    #[error("credentials: {0}")]
    Credentials(String),

    /// The fulfillment API does not know the requested serial.
    #[error("not found: {0}")]
    NotFound(String),

    /// The fulfillment API answered with something we cannot use.
    #[error("api: {0}")]
    Api(String),

    #[error("config: {0}")]
    Config(String),

    /// Direct database errors (auto-converted via `?` in the inventory module).
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, EsimError>;

// ---------------------------------------------------------------------------
// Error kinds
// ---------------------------------------------------------------------------

/// Stable error category, independent of the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Format,
    Validation,
    Decode,
    Storage,
    Connectivity,
    Credentials,
    NotFound,
    Api,
    Config,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Format => "format",
            Self::Validation => "validation",
            Self::Decode => "decode",
            Self::Storage => "storage",
            Self::Connectivity => "connectivity",
            Self::Credentials => "credentials",
            Self::NotFound => "not_found",
            Self::Api => "api",
            Self::Config => "config",
        }
    }

    /// Rebuild an error of this kind carrying `reason`.
    ///
    /// Used where an outcome has to be replayed to several callers; the
    /// database variant collapses into [`EsimError::Storage`].
    pub fn into_error(self, reason: impl Into<String>) -> EsimError {
        let reason = reason.into();
        match self {
            Self::Format => EsimError::Format(reason),
            Self::Validation => EsimError::Validation(reason),
            Self::Decode => EsimError::Decode(reason),
            Self::Storage => EsimError::Storage(reason),
            Self::Connectivity => EsimError::Connectivity(reason),
            Self::Credentials => EsimError::Credentials(reason),
            Self::NotFound => EsimError::NotFound(reason),
            Self::Api => EsimError::Api(reason),
            Self::Config => EsimError::Config(reason),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&EsimError> for ErrorKind {
    fn from(e: &EsimError) -> Self {
        match e {
            EsimError::Format(_) => Self::Format,
            EsimError::Validation(_) => Self::Validation,
            EsimError::Decode(_) => Self::Decode,
            EsimError::Storage(_) | EsimError::Database(_) => Self::Storage,
            EsimError::Connectivity(_) => Self::Connectivity,
            EsimError::Credentials(_) => Self::Credentials,
            EsimError::NotFound(_) => Self::NotFound,
            EsimError::Api(_) => Self::Api,
            EsimError::Config(_) => Self::Config,
        }
    }
}

impl EsimError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from(self)
    }

    /// Human-readable reason without the kind prefix, suitable for direct
    /// display to an end user.
    pub fn reason(&self) -> String {
        match self {
            Self::Format(m)
            | Self::Validation(m)
            | Self::Decode(m)
            | Self::Storage(m)
            | Self::Connectivity(m)
            | Self::Credentials(m)
            | Self::NotFound(m)
            | Self::Api(m)
            | Self::Config(m) => m.clone(),
            Self::Database(e) => e.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Context extension trait
// ---------------------------------------------------------------------------

/// Extension trait that adds domain-specific context to any `Result<T, E>`.
///
/// Usage mirrors `anyhow::Context` but tags the error with the originating
/// category so that callers can branch on [`ErrorKind`].
///
/// ```ignore
/// std::fs::read(path).ctx_storage("read session cache")?;
/// ```
pub trait ResultExt<T> {
    fn ctx_format(self, msg: &str) -> Result<T>;
    fn ctx_validation(self, msg: &str) -> Result<T>;
    fn ctx_storage(self, msg: &str) -> Result<T>;
    fn ctx_connectivity(self, msg: &str) -> Result<T>;
    fn ctx_api(self, msg: &str) -> Result<T>;
    fn ctx_config(self, msg: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn ctx_format(self, msg: &str) -> Result<T> {
        self.map_err(|e| EsimError::Format(format!("{msg}: {e}")))
    }
    fn ctx_validation(self, msg: &str) -> Result<T> {
        self.map_err(|e| EsimError::Validation(format!("{msg}: {e}")))
    }
    fn ctx_storage(self, msg: &str) -> Result<T> {
        self.map_err(|e| EsimError::Storage(format!("{msg}: {e}")))
    }
    fn ctx_connectivity(self, msg: &str) -> Result<T> {
        self.map_err(|e| EsimError::Connectivity(format!("{msg}: {e}")))
    }
    fn ctx_api(self, msg: &str) -> Result<T> {
        self.map_err(|e| EsimError::Api(format!("{msg}: {e}")))
    }
    fn ctx_config(self, msg: &str) -> Result<T> {
        self.map_err(|e| EsimError::Config(format!("{msg}: {e}")))
    }
}

/// Same as [`ResultExt`] but for `Option<T>` (converts `None` into an error).
pub trait OptionExt<T> {
    fn required_format(self, msg: &str) -> Result<T>;
    fn required_storage(self, msg: &str) -> Result<T>;
    fn required_credentials(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required_format(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| EsimError::Format(msg.to_string()))
    }
    fn required_storage(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| EsimError::Storage(msg.to_string()))
    }
    fn required_credentials(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| EsimError::Credentials(msg.to_string()))
    }
}
