//! MIDI Transcription Enhancement
//!
//! Post-processing for automatic music transcriptions: per-note decay and
//! timbre features are measured from the source audio, onset-fragmented
//! notes and duplicate instrument tracks are consolidated by decay
//! similarity, and instrument programs are refined by timbre.

pub mod audio;
pub mod config;
pub mod error;
pub mod instrument;
pub mod midi;
pub mod passes;
pub mod recorder;
pub mod report;
pub mod spectral;
pub mod transcription;

pub use config::EnhancementConfig;
pub use error::{EnhanceError, FeatureError, RecorderError, Result};
pub use passes::{
    Consolidator, DecayConsolidator, FeatureExtractor, FeatureSet, PronyExtractor, Refiner,
    TimbreRefiner,
};
pub use recorder::MetricsRecorder;
pub use report::{EnhancementReport, PipelineStatus, StageOutcome};
pub use transcription::{InstrumentTrack, Note, Transcription};

use ndarray::{Array1, ArrayD};
use passes::pass_4::EnhancementComparison;
use report::{InputStats, Intermediates, OutputStats};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Position of a run in the enhancement pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Init,
    Validated,
    FeaturesExtracted,
    Consolidated,
    Refined,
    MetricsComputed,
    Done,
    /// Terminal: feature extraction failed systemically, original returned
    Degraded,
}

fn advance(state: &mut PipelineState, next: PipelineState) {
    debug!(from = ?*state, to = ?next, "pipeline state");
    *state = next;
}

/// Result of a file-based run
#[derive(Debug, Clone)]
pub struct FileEnhancement {
    pub original: Transcription,
    pub enhanced: Transcription,
    pub report: EnhancementReport,
    /// Mono audio at `sample_rate`, as the pipeline saw it
    pub audio: Array1<f32>,
    pub sample_rate: u32,
    pub output_path: PathBuf,
}

/// Main enhancement pipeline
pub struct Enhancer {
    config: EnhancementConfig,
    extractor: Arc<dyn FeatureExtractor>,
    consolidator: Arc<dyn Consolidator>,
    refiner: Arc<dyn Refiner>,
    recorder: Option<Arc<MetricsRecorder>>,
}

impl Enhancer {
    /// Create an enhancer with the default stages
    pub fn new(config: EnhancementConfig) -> Result<Self> {
        config::validate_config(&config)?;
        Ok(Self {
            config,
            extractor: Arc::new(PronyExtractor),
            consolidator: Arc::new(DecayConsolidator),
            refiner: Arc::new(TimbreRefiner),
            recorder: None,
        })
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn FeatureExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_consolidator(mut self, consolidator: Arc<dyn Consolidator>) -> Self {
        self.consolidator = consolidator;
        self
    }

    pub fn with_refiner(mut self, refiner: Arc<dyn Refiner>) -> Self {
        self.refiner = refiner;
        self
    }

    /// Record metrics of every file-based run
    pub fn with_recorder(mut self, recorder: Arc<MetricsRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn config(&self) -> &EnhancementConfig {
        &self.config
    }

    pub fn recorder(&self) -> Option<&MetricsRecorder> {
        self.recorder.as_deref()
    }

    /// Check inputs before any stage runs and collapse the audio to mono
    pub fn validate_inputs(
        &self,
        midi: &Transcription,
        audio: &ArrayD<f32>,
        sample_rate: u32,
    ) -> Result<Array1<f32>> {
        if sample_rate == 0 {
            return Err(EnhanceError::InputValidation(
                "sample rate must be positive".to_string(),
            ));
        }
        let mono = audio::to_mono(audio)?;
        if mono.is_empty() {
            return Err(EnhanceError::InputValidation("audio is empty".to_string()));
        }
        if midi.total_notes() == 0 {
            return Err(EnhanceError::InputValidation(
                "transcription has no notes".to_string(),
            ));
        }

        let midi_duration = midi.end_time();
        let audio_duration = mono.len() as f64 / sample_rate as f64;
        if (midi_duration - audio_duration).abs() > self.config.duration_tolerance_seconds {
            warn!(
                midi_duration = format!("{:.2}", midi_duration),
                audio_duration = format!("{:.2}", audio_duration),
                "MIDI and audio durations disagree"
            );
        }
        Ok(mono)
    }

    /// Run all stages on an in-memory transcription and waveform.
    ///
    /// A systemic feature extraction failure returns the original
    /// transcription with a degraded report; any other extraction failure
    /// is an error. Later stage failures fall back to the last good
    /// transcription and are recorded in the report.
    pub fn enhance_transcription(
        &self,
        midi: &Transcription,
        audio: &ArrayD<f32>,
        sample_rate: u32,
        return_intermediates: bool,
    ) -> Result<(Transcription, EnhancementReport)> {
        let started = Instant::now();
        let mut state = PipelineState::Init;

        let mono = self.validate_inputs(midi, audio, sample_rate)?;
        let samples: Vec<f32> = mono.iter().copied().collect();
        advance(&mut state, PipelineState::Validated);

        let mut report = EnhancementReport::new(
            &self.config,
            InputStats {
                total_notes: midi.total_notes(),
                total_instruments: midi.instrument_count(),
                duration_seconds: midi.end_time(),
                audio_duration_seconds: samples.len() as f64 / sample_rate as f64,
                sample_rate,
            },
        );
        info!(
            notes = report.input_stats.total_notes,
            instruments = report.input_stats.total_instruments,
            "starting enhancement"
        );

        // Stage 1: Feature extraction
        info!("[Stage 1/4] Feature extraction");
        let stage = Instant::now();
        let extracted = self
            .extractor
            .extract(midi, &samples, sample_rate, &self.config);
        report.timing.feature_extraction = stage.elapsed().as_secs_f64();

        let features = match extracted {
            Ok(features) => {
                report.stages.feature_extraction =
                    Some(StageOutcome::Success(features.stats().clone()));
                advance(&mut state, PipelineState::FeaturesExtracted);
                features
            }
            Err(err) if err.is_systemic() => {
                warn!(
                    error = %err,
                    "feature extraction failed systemically, returning original transcription"
                );
                report.stages.feature_extraction = Some(StageOutcome::Failed {
                    error: err.to_string(),
                });
                report.pipeline_status = PipelineStatus::Degraded;
                report.output_stats = OutputStats::of(midi);
                report.timing.total_seconds = started.elapsed().as_secs_f64();
                advance(&mut state, PipelineState::Degraded);
                return Ok((midi.clone(), report));
            }
            Err(err) => {
                error!(error = %err, "feature extraction failed");
                return Err(EnhanceError::FeatureExtraction(err));
            }
        };
        if return_intermediates {
            report.intermediates = Some(Intermediates::from_features(&features));
        }

        // Stage 2: Consolidation
        info!("[Stage 2/4] Decay consolidation");
        let stage = Instant::now();
        let consolidation = self
            .consolidator
            .consolidate(midi, &features, &self.config);
        let consolidated = match consolidation {
            Ok((consolidated, stats)) => {
                report.stages.consolidation = Some(StageOutcome::Success(stats));
                consolidated
            }
            Err(err) => {
                warn!(
                    error = %err,
                    "consolidation failed, continuing with original transcription"
                );
                report.stages.consolidation = Some(StageOutcome::Failed {
                    error: err.to_string(),
                });
                midi.clone()
            }
        };
        report.timing.consolidation = stage.elapsed().as_secs_f64();
        advance(&mut state, PipelineState::Consolidated);
        if let Some(intermediates) = report.intermediates.as_mut() {
            intermediates.post_consolidation = Some(consolidated.clone());
        }

        // Stage 3: Refinement
        info!("[Stage 3/4] Timbre refinement");
        let stage = Instant::now();
        let enhanced = match self.refiner.refine(
            &consolidated,
            &samples,
            sample_rate,
            &self.config,
            &features,
        ) {
            Ok((refined, refinement)) => {
                report.stages.refinement = Some(StageOutcome::Success(refinement));
                refined
            }
            Err(err) => {
                warn!(
                    error = %err,
                    "refinement failed, continuing with consolidated transcription"
                );
                report.stages.refinement = Some(StageOutcome::Failed {
                    error: err.to_string(),
                });
                consolidated
            }
        };
        report.timing.refinement = stage.elapsed().as_secs_f64();
        advance(&mut state, PipelineState::Refined);

        // Stage 4: Metrics
        info!("[Stage 4/4] Metrics");
        let stage = Instant::now();
        report.stages.metrics = Some(match passes::pass_4::run(midi, &enhanced) {
            Ok(metrics) => StageOutcome::Success(metrics),
            Err(err) => {
                warn!(error = %err, "metrics computation failed");
                StageOutcome::Failed {
                    error: err.to_string(),
                }
            }
        });
        report.timing.metrics = stage.elapsed().as_secs_f64();
        advance(&mut state, PipelineState::MetricsComputed);

        report.output_stats = OutputStats::of(&enhanced);
        report.timing.total_seconds = started.elapsed().as_secs_f64();
        advance(&mut state, PipelineState::Done);

        info!(
            notes_before = report.input_stats.total_notes,
            notes_after = report.output_stats.total_notes,
            instruments_before = report.input_stats.total_instruments,
            instruments_after = report.output_stats.total_instruments,
            seconds = format!("{:.2}", report.timing.total_seconds),
            "enhancement complete"
        );

        Ok((enhanced, report))
    }

    /// Load MIDI and audio from disk, enhance, and write the result.
    ///
    /// Without `output_path` the result goes next to the input as
    /// `<stem>_enhanced.mid`. Metrics are recorded when a recorder is
    /// attached; recording failures are logged only.
    pub fn enhance_from_file(
        &self,
        midi_path: impl AsRef<Path>,
        audio_path: impl AsRef<Path>,
        output_path: Option<&Path>,
    ) -> Result<FileEnhancement> {
        let midi_path = midi_path.as_ref();
        let audio_path = audio_path.as_ref();
        for path in [midi_path, audio_path] {
            if !path.exists() {
                return Err(EnhanceError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("input file not found: {}", path.display()),
                )));
            }
        }

        let original = midi::read_midi(midi_path)?;
        let (audio, sample_rate) =
            audio::load_audio_file(audio_path, Some(self.config.sample_rate))?;
        info!(
            midi = %midi_path.display(),
            audio = %audio_path.display(),
            sample_rate,
            "loaded inputs"
        );

        let waveform = audio.clone().into_dyn();
        let (enhanced, mut report) =
            self.enhance_transcription(&original, &waveform, sample_rate, false)?;

        let output_path = output_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| default_output_path(midi_path));
        midi::write_midi(&enhanced, &output_path)?;
        report.output_path = Some(output_path.display().to_string());
        info!(path = %output_path.display(), "wrote enhanced MIDI");

        if let Some(recorder) = &self.recorder {
            let name = file_stem(midi_path);
            let id = name.split('_').next().unwrap_or(&name).to_string();
            let duration = audio.len() as f64 / sample_rate as f64;
            if let Err(err) = recorder.record_track(&id, &name, &report, duration) {
                warn!(error = %err, "failed to record metrics");
            }
        }

        Ok(FileEnhancement {
            original,
            enhanced,
            report,
            audio,
            sample_rate,
            output_path,
        })
    }

    /// Before/after comparison, with precision/recall deltas when a reference is given
    pub fn compare_enhancement(
        &self,
        original: &Transcription,
        enhanced: &Transcription,
        audio: &ArrayD<f32>,
        sample_rate: u32,
        ground_truth: Option<&Transcription>,
    ) -> Result<EnhancementComparison> {
        if sample_rate == 0 {
            return Err(EnhanceError::InputValidation(
                "sample rate must be positive".to_string(),
            ));
        }
        let audio_duration = audio::frames_per_channel(audio)? as f64 / sample_rate as f64;
        Ok(passes::pass_4::compare(
            original,
            enhanced,
            audio_duration,
            ground_truth,
            &self.config.evaluation,
        ))
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "track".to_string())
}

/// `<dir>/<stem>_enhanced.mid` next to the input
pub fn default_output_path(midi_path: &Path) -> PathBuf {
    let name = format!("{}_enhanced.mid", file_stem(midi_path));
    match midi_path.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}
