use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// The method's schema could not be obtained or does not exist.
    #[error("schema resolution failed: {0}")]
    SchemaResolutionFailed(String),

    /// The payload does not match the method's input message.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("streaming method '{0}' cannot be invoked dynamically")]
    StreamingNotSupported(String),

    #[error("could not connect to backend: {0}")]
    BackendUnavailable(String),

    /// The backend answered with a non-OK status.
    #[error("remote call failed ({code}): {message}")]
    Remote { code: tonic::Code, message: String },

    /// A well-formed backend response could not be converted.
    #[error("response from backend could not be converted: {0}")]
    InternalConversionError(String),
}

impl ProxyError {
    /// Map a status from the schema or invocation phase.
    #[must_use]
    pub fn from_status(status: &tonic::Status) -> Self {
        match status.code() {
            tonic::Code::Unavailable => Self::BackendUnavailable(status.message().to_owned()),
            code => Self::Remote {
                code,
                message: status.message().to_owned(),
            },
        }
    }
}
