use thiserror::Error;

/// The single hard failure of config resolution. Unreachable source,
/// missing document, malformed content and transport errors all collapse
/// here: the caller's only correct reaction is to abort startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config unavailable: {detail}")]
    Unavailable { detail: String },
}

impl ConfigError {
    pub fn unavailable(detail: impl Into<String>) -> Self {
        ConfigError::Unavailable {
            detail: detail.into(),
        }
    }
}
