/// Result alias that carries the custom [`BridgeError`] type.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Common error type for the core crate.
///
/// Everyday update/read traffic has no error channel at all; the variants
/// here surface only through the one-shot install handshake and the optional
/// wire-format helpers.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Free-form failure reported by callers layered on top of the bridge,
    /// such as the demo application.
    #[error("{0}")]
    Message(String),
    /// An install was scheduled while a previous one was still pending.
    #[error("an installation is already in progress")]
    AlreadyInstalling,
    /// An install was scheduled after the binding was already established.
    #[error("the consumer binding is already installed")]
    AlreadyInstalled,
    /// The consumer-side binding registration did not complete.
    #[error("binding registration failed: {cause}")]
    RegistrationFailed { cause: String },
    /// A packed frame payload could not be decoded.
    #[error("malformed frame payload: {0}")]
    MalformedPayload(String),
    /// Wrapper around JSON encoding errors from the wire helpers.
    #[error("{0}")]
    Encode(#[from] serde_json::Error),
}

impl BridgeError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Creates a [`BridgeError::RegistrationFailed`] from any printable cause.
    pub fn registration<T: Into<String>>(cause: T) -> Self {
        Self::RegistrationFailed {
            cause: cause.into(),
        }
    }
}

impl From<&str> for BridgeError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for BridgeError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
