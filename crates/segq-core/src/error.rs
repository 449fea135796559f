use thiserror::Error;

use crate::config_manager::ConfigError;

#[derive(Error, Debug)]
pub enum SegqError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Logging error: {0}")]
    Logging(String),
}

/// Outcome of a take request that never received an item.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeError {
    /// The cancellation token fired (or the request was dropped) before an
    /// item was delivered.
    #[error("take request was canceled before an item arrived")]
    Canceled,
}

pub type Result<T> = std::result::Result<T, SegqError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_manager::QueueConfig;

    fn checked_capacity(capacity: usize) -> Result<usize> {
        QueueConfig::with_segment_capacity(capacity).validate()?;
        Ok(capacity)
    }

    #[test]
    fn config_errors_convert_with_question_mark() {
        assert_eq!(checked_capacity(16).unwrap(), 16);
        let err = checked_capacity(0).unwrap_err();
        assert!(matches!(err, SegqError::Config(ConfigError::ValidationError(_))));
        assert!(err.to_string().starts_with("Configuration error:"));
    }
}
