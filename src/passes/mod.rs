//! Enhancement stages, run in order by the coordinator
//!
//! Each stage lives in its own `pass_N` module with a free `run` function.
//! The coordinator reaches the first three through the traits below so a
//! stage can be swapped out (for testing fallback paths, or for a different
//! fitting method) without touching the pipeline.

pub mod pass_1;
pub mod pass_2;
pub mod pass_3;
pub mod pass_4;

use crate::config::EnhancementConfig;
use crate::error::{FeatureError, Result};
use crate::transcription::Transcription;

pub use pass_1::{FeatureSet, PronyExtractor};
pub use pass_2::{ConsolidationStats, DecayConsolidator};
pub use pass_3::{RefinementReport, TimbreRefiner};

/// Pass 1: per-note decay and timbre features
pub trait FeatureExtractor: Send + Sync {
    fn extract(
        &self,
        midi: &Transcription,
        audio: &[f32],
        sample_rate: u32,
        config: &EnhancementConfig,
    ) -> std::result::Result<FeatureSet, FeatureError>;
}

/// Pass 2: decay-based consolidation
pub trait Consolidator: Send + Sync {
    fn consolidate(
        &self,
        midi: &Transcription,
        features: &FeatureSet,
        config: &EnhancementConfig,
    ) -> Result<(Transcription, ConsolidationStats)>;
}

/// Pass 3: timbre-based refinement
pub trait Refiner: Send + Sync {
    fn refine(
        &self,
        midi: &Transcription,
        audio: &[f32],
        sample_rate: u32,
        config: &EnhancementConfig,
        features: &FeatureSet,
    ) -> Result<(Transcription, RefinementReport)>;
}
