use thiserror::Error;

/// Failures surfaced to the user as `"<Kind>: <message>"`.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{service}: {message}")]
    Upstream {
        service: &'static str,
        message: String,
    },
    #[error("{0}")]
    Transcode(String),
    #[error("{0}")]
    Dispatch(String),
}

impl RelayError {
    pub fn upstream(service: &'static str, err: anyhow::Error) -> Self {
        RelayError::Upstream {
            service,
            message: format!("{:#}", err),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Upstream { .. } => "UpstreamError",
            RelayError::Transcode(_) => "TranscodeError",
            RelayError::Dispatch(_) => "DispatchError",
        }
    }
}

/// Text sent back when handling a message failed.
pub fn user_facing(err: &anyhow::Error) -> String {
    match err.downcast_ref::<RelayError>() {
        Some(relay) => format!("❌ {}: {}", relay.kind(), relay),
        None => format!("❌ Error: {:#}", err),
    }
}
