use thiserror::Error;

/// Configuration failures. Always fatal and only possible at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A malformed inbound record. Counted and dropped, never propagated
/// past the component that observed it.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("malformed decimal in {field}: {value:?}")]
    MalformedDecimal { field: &'static str, value: String },

    #[error("negative quantity in {field}: {value:?}")]
    NegativeQuantity { field: &'static str, value: String },

    #[error("non-positive price in {field}: {value:?}")]
    NonPositivePrice { field: &'static str, value: String },
}

/// A per-trade detector failure. Isolated to the detector that raised it.
#[derive(Debug, Error)]
#[error("detector {detector}: {message}")]
pub struct DetectorError {
    pub detector: &'static str,
    pub message: String,
}

/// Top-level error taxonomy for the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("initialization error: {0}")]
    Init(String),

    #[error("stream error: {0}")]
    TransientStream(String),

    #[error("apply error: {0}")]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Detector(#[from] DetectorError),

    #[error("capacity error: {0}")]
    Capacity(String),
}

impl EngineError {
    /// Process exit code for fatal errors surfaced at the binary boundary.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Config(_) => 1,
            EngineError::Init(_) => 2,
            _ => 3,
        }
    }

    /// Whether the error terminates the engine. Apply and detector errors
    /// are counted and dropped inside the pipeline; stream errors trigger
    /// recovery rather than shutdown.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Config(_) | EngineError::Init(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(
            EngineError::Config(ConfigError::Invalid("x".into())).exit_code(),
            1
        );
        assert_eq!(EngineError::Init("no snapshot".into()).exit_code(), 2);
        assert_eq!(EngineError::TransientStream("gap".into()).exit_code(), 3);
    }

    #[test]
    fn test_fatality() {
        assert!(EngineError::Init("x".into()).is_fatal());
        assert!(!EngineError::Apply(ApplyError::MalformedDecimal {
            field: "p",
            value: "abc".into()
        })
        .is_fatal());
    }
}
