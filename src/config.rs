//! Configuration system for the enhancement pipeline

use crate::error::{EnhanceError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration structure, read by every stage and never mutated during a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhancementConfig {
    /// Rate audio files are resampled to on load
    pub sample_rate: u32,
    /// Allowed disagreement between MIDI and audio duration before warning
    pub duration_tolerance_seconds: f64,
    pub features: FeatureConfig,
    pub consolidation: ConsolidationConfig,
    pub refinement: RefinementConfig,
    pub evaluation: EvaluationConfig,
}

impl Default for EnhancementConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            duration_tolerance_seconds: 1.0,
            features: FeatureConfig::default(),
            consolidation: ConsolidationConfig::default(),
            refinement: RefinementConfig::default(),
            evaluation: EvaluationConfig::default(),
        }
    }
}

/// Per-note decay and spectral feature extraction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Longest stretch of audio after an onset used for the decay fit
    pub decay_window_seconds: f64,
    /// Envelope hop; frames are twice this long
    pub envelope_hop_seconds: f64,
    /// Fewest envelope frames a fit may use
    pub min_fit_frames: usize,
    /// Envelope peaks below this RMS are treated as silent
    pub min_peak_rms: f32,
    /// Decay constants above this (1/s) are rejected as clicks
    pub max_decay_constant: f64,
    /// FFT size for the spectral centroid
    pub n_fft: usize,
    /// Failure ratio above which extraction is considered systemically broken
    pub systemic_failure_ratio: f64,
    /// Fit notes on the rayon thread pool
    pub parallel: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            decay_window_seconds: 0.5,
            envelope_hop_seconds: 0.005,
            min_fit_frames: 6,
            min_peak_rms: 1e-4,
            max_decay_constant: 500.0,
            n_fft: 2048,
            systemic_failure_ratio: 0.5,
            parallel: true,
        }
    }
}

/// How strictly instrument tracks must agree before they are merged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationStrategy {
    /// Decay similarity and spectral distance must both pass
    Conservative,
    /// Decay similarity alone decides
    Aggressive,
}

impl ConsolidationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsolidationStrategy::Conservative => "conservative",
            ConsolidationStrategy::Aggressive => "aggressive",
        }
    }
}

/// Decay-based consolidation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub strategy: ConsolidationStrategy,
    /// Minimum decay similarity (min/max ratio, 0-1) for a merge
    pub decay_threshold: f64,
    /// Maximum spectral centroid distance (Hz) for a merge
    pub spectral_threshold: f64,
    /// Below this overall fit success rate decay features are not trusted
    pub min_feature_success_rate: f64,
    /// Largest gap between same-pitch fragments that may be rejoined
    pub fragment_gap_seconds: f64,
    /// Gap used when decay evidence is unavailable
    pub fallback_gap_seconds: f64,
    pub max_merges: Option<usize>,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            strategy: ConsolidationStrategy::Conservative,
            decay_threshold: 0.80,
            spectral_threshold: 200.0,
            min_feature_success_rate: 0.7,
            fragment_gap_seconds: 0.05,
            fallback_gap_seconds: 0.01,
            max_merges: None,
        }
    }
}

/// Timbre-based refinement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    /// Family mismatch (octaves) tolerated before a reassignment is considered
    pub timbre_tolerance_octaves: f64,
    /// How much better the replacement family must score
    pub reassignment_margin: f64,
    /// Fewest timbre observations a track needs to be judged
    pub min_notes: usize,
    pub adjust_durations: bool,
    /// Level drop that defines a note's decay-implied end
    pub decay_floor_db: f64,
    /// Notes longer than this multiple of their implied length get clamped
    pub duration_tolerance: f64,
    pub min_note_duration: f64,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            timbre_tolerance_octaves: 0.5,
            reassignment_margin: 0.25,
            min_notes: 5,
            adjust_durations: true,
            decay_floor_db: 60.0,
            duration_tolerance: 2.0,
            min_note_duration: 0.03,
        }
    }
}

/// Before/after and ground-truth evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    pub onset_tolerance_seconds: f64,
    /// Same-pitch re-onsets within this window count as fragmentation
    pub fragmentation_window_seconds: f64,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            onset_tolerance_seconds: 0.05,
            fragmentation_window_seconds: 0.05,
        }
    }
}

/// Validate configuration parameters
pub fn validate_config(config: &EnhancementConfig) -> Result<()> {
    let fail = |msg: String| Err(EnhanceError::Config(msg));

    if config.sample_rate == 0 {
        return fail("sample_rate must be positive".to_string());
    }
    if config.duration_tolerance_seconds < 0.0 {
        return fail("duration_tolerance_seconds must be >= 0".to_string());
    }

    let f = &config.features;
    if !(f.decay_window_seconds > 0.0) || !(f.envelope_hop_seconds > 0.0) {
        return fail("feature windows must be positive".to_string());
    }
    if f.envelope_hop_seconds * 2.0 >= f.decay_window_seconds {
        return fail("envelope_hop_seconds too large for decay_window_seconds".to_string());
    }
    if f.min_fit_frames < 2 {
        return fail("min_fit_frames must be at least 2".to_string());
    }
    if !f.n_fft.is_power_of_two() || f.n_fft < 64 {
        return fail(format!("n_fft must be a power of two >= 64, got {}", f.n_fft));
    }
    if !(0.0..=1.0).contains(&f.systemic_failure_ratio) {
        return fail("systemic_failure_ratio must be within [0, 1]".to_string());
    }

    let c = &config.consolidation;
    if !(0.0..=1.0).contains(&c.decay_threshold) {
        return fail(format!(
            "decay_threshold must be within [0, 1], got {}",
            c.decay_threshold
        ));
    }
    if c.spectral_threshold < 0.0 {
        return fail("spectral_threshold must be >= 0".to_string());
    }
    if !(0.0..=1.0).contains(&c.min_feature_success_rate) {
        return fail("min_feature_success_rate must be within [0, 1]".to_string());
    }
    if c.fallback_gap_seconds < 0.0 || c.fragment_gap_seconds < c.fallback_gap_seconds {
        return fail("fragment_gap_seconds must be >= fallback_gap_seconds >= 0".to_string());
    }

    let r = &config.refinement;
    if r.timbre_tolerance_octaves < 0.0 || r.reassignment_margin < 0.0 {
        return fail("refinement tolerances must be >= 0".to_string());
    }
    if !(r.decay_floor_db > 0.0) || r.duration_tolerance < 1.0 || r.min_note_duration <= 0.0 {
        return fail("invalid duration refinement parameters".to_string());
    }

    if config.evaluation.onset_tolerance_seconds <= 0.0 {
        return fail("onset_tolerance_seconds must be positive".to_string());
    }

    Ok(())
}

/// Load configuration from a YAML (`.yaml`/`.yml`) or JSON file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EnhancementConfig> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_lowercase();

    let config: EnhancementConfig = match extension.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content)
            .map_err(|e| EnhanceError::Config(format!("{}: {}", path.display(), e)))?,
        _ => serde_json::from_str(&content)?,
    };
    validate_config(&config)?;
    Ok(config)
}

/// Save configuration to JSON file
pub fn save_config<P: AsRef<Path>>(config: &EnhancementConfig, path: P) -> Result<()> {
    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
