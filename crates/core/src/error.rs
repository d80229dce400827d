/// Result alias that carries the custom [`MixerError`] type.
pub type Result<T> = std::result::Result<T, MixerError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum MixerError {
    /// Free-form message for failures that do not warrant their own variant.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Settings document could not be parsed or encoded.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    /// The requested operation is not valid in the current state. Nothing was
    /// changed.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),
    #[error("parameter `{0}` is already registered")]
    DuplicateParameter(String),
    /// The parameter has no numeric range and cannot be driven by a
    /// controller.
    #[error("parameter `{0}` cannot be bound to a controller")]
    Unbindable(String),
    /// Serial or controller device failure. These are reported as status
    /// changes and never abort the process.
    #[error("device error: {0}")]
    Device(String),
    /// A single settings section failed to load.
    #[error("settings section `{section}`: {reason}")]
    Section { section: String, reason: String },
}

impl MixerError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn section(section: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Section {
            section: section.into(),
            reason: reason.into(),
        }
    }
}

impl From<&str> for MixerError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for MixerError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
