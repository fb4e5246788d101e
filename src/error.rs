//! Error types for the enhancement pipeline

use thiserror::Error;

/// Crate-level error for enhancement runs
#[derive(Debug, Error)]
pub enum EnhanceError {
    /// E001: Inputs rejected before any stage ran
    #[error("E001: Input validation error - {0}")]
    InputValidation(String),
    /// E002: Feature extraction failed in a way no later stage can recover from
    #[error("E002: Critical feature extraction failure - {0}")]
    FeatureExtraction(#[from] FeatureError),
    /// E003: Decay consolidation failed
    #[error("E003: Consolidation error - {0}")]
    Consolidation(String),
    /// E004: Timbre refinement failed
    #[error("E004: Refinement error - {0}")]
    Refinement(String),
    /// E005: Metrics computation failed
    #[error("E005: Metrics error - {0}")]
    Metrics(String),
    /// E006: MIDI file could not be parsed
    #[error("E006: MIDI parse error - {0}")]
    MidiParse(String),
    /// E007: MIDI file could not be written
    #[error("E007: MIDI export error - {0}")]
    MidiExport(String),
    /// E008: Audio file I/O error
    #[error("E008: Audio file error - {0}")]
    AudioFile(String),
    /// E009: Audio file format not supported
    #[error("E009: Invalid audio format - {0}")]
    InvalidAudioFormat(String),
    /// E010: Configuration rejected
    #[error("E010: Configuration error - {0}")]
    Config(String),
    /// E011: Metrics recorder failure
    #[error("E011: Metrics recorder error - {0}")]
    Recorder(#[from] RecorderError),
    /// E012: Generic file I/O error
    #[error("E012: File I/O error - {0}")]
    Io(#[from] std::io::Error),
    /// E013: JSON serialization error
    #[error("E013: JSON serialization error - {0}")]
    Json(#[from] serde_json::Error),
}

/// Feature extraction failures.
///
/// The two kinds drive different recovery paths in the coordinator: a
/// systemic decay failure degrades the run, anything else aborts it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeatureError {
    /// Most notes failed decay fitting, which points at misaligned or unusable audio
    #[error("decay fitting failed for {failed} of {total} notes")]
    SystemicDecayFailure { failed: usize, total: usize },
    /// Extraction could not run at all
    #[error("{0}")]
    Extraction(String),
}

impl FeatureError {
    /// Whether the failure should degrade the run instead of aborting it
    pub fn is_systemic(&self) -> bool {
        matches!(self, FeatureError::SystemicDecayFailure { .. })
    }
}

/// Metrics recorder failures
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("metrics file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metrics JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("metrics CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("CSV header mismatch: expected [{expected}], found [{found}]")]
    HeaderMismatch { expected: String, found: String },
}

/// Result type alias for enhancement operations
pub type Result<T> = std::result::Result<T, EnhanceError>;
