pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("listing folder {folder_id} failed: {message}")]
    Traversal { folder_id: String, message: String },

    #[error("source api error: {message}")]
    Source { message: String },

    #[error("registration not ready after {attempts} attempts")]
    MetadataTimeout { attempts: u32 },

    #[error("upload failed: {message}")]
    UploadTransport { message: String },

    #[error("finalize failed after bytes were written (blob may be orphaned): {message}")]
    Finalize { message: String },

    #[error("precondition failed: {message}")]
    Precondition { message: String },

    #[error("report error: {message}")]
    Report { message: String },

    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn source_api(message: impl Into<String>) -> Self {
        Self::Source {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::UploadTransport {
            message: message.into(),
        }
    }

    pub fn report(message: impl Into<String>) -> Self {
        Self::Report {
            message: message.into(),
        }
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    /// Stable machine-readable code, used in reports and CLI errors.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "config.invalid",
            Self::Io(_) => "io",
            Self::Traversal { .. } => "traversal.listing_failed",
            Self::Source { .. } => "source.unavailable",
            Self::MetadataTimeout { .. } => "registration.timeout",
            Self::UploadTransport { .. } => "upload.transport",
            Self::Finalize { .. } => "finalize.failed",
            Self::Precondition { .. } => "precondition.failed",
            Self::Report { .. } => "report.invalid",
            Self::Cancelled => "task.cancelled",
        }
    }
}
