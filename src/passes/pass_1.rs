//! Pass 1: Decay & Timbre Feature Extraction

use crate::audio::median;
use crate::config::{EnhancementConfig, FeatureConfig};
use crate::error::FeatureError;
use crate::passes::FeatureExtractor;
use crate::spectral::{rms_envelope, SpectrumAnalyzer};
use crate::transcription::{Note, Transcription};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Decay constant (1/s) assumed for notes whose fit failed
pub const DEFAULT_DECAY_CONSTANT: f64 = 5.0;

/// Position of a note in the transcription it was extracted from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NoteId {
    pub track: usize,
    pub index: usize,
}

/// Why a decay fit was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitFailure {
    /// Onset lies outside the audio
    OutOfRange,
    /// Window cut short by the end of audio or the next onset
    TooShort,
    /// Envelope peak below the silence floor
    TooQuiet,
    /// Envelope is not an exponential decay
    NotDecaying,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoteFeatures {
    pub decay_constant: f64,
    /// Hz, 0.0 when the segment is silent or out of range
    pub spectral_centroid: f64,
    pub extraction_success: bool,
    pub failure: Option<FitFailure>,
}

impl NoteFeatures {
    /// Decay constant only when the fit succeeded
    pub fn fitted_decay(&self) -> Option<f64> {
        self.extraction_success.then_some(self.decay_constant)
    }

    pub fn has_timbre(&self) -> bool {
        self.spectral_centroid > 0.0
    }
}

/// Per-track aggregate of note features
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackFeatures {
    pub program: u8,
    pub is_drum: bool,
    pub note_count: usize,
    pub fitted_notes: usize,
    /// Median of successful fits
    pub decay_constant: Option<f64>,
    /// Mean centroid of non-silent notes
    pub spectral_centroid: Option<f64>,
    pub timbre_observations: usize,
    pub success_rate: f64,
}

/// Summary statistics for reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub notes_processed: usize,
    pub notes_succeeded: usize,
    pub instruments_processed: usize,
    /// Fit success rate of every track that has notes, in track order
    pub prony_success_rates: Vec<f64>,
    pub overall_success_rate: f64,
    pub failures: BTreeMap<FitFailure, usize>,
}

impl FeatureStats {
    pub fn success_rate_avg(&self) -> f64 {
        crate::audio::mean(&self.prony_success_rates)
    }

    pub fn success_rate_min(&self) -> f64 {
        self.prony_success_rates
            .iter()
            .copied()
            .min_by(f64::total_cmp)
            .unwrap_or(0.0)
    }

    pub fn success_rate_max(&self) -> f64 {
        self.prony_success_rates
            .iter()
            .copied()
            .max_by(f64::total_cmp)
            .unwrap_or(0.0)
    }
}

/// Features for every note of one transcription.
///
/// Built once all fits have completed and read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSet {
    notes: BTreeMap<NoteId, NoteFeatures>,
    /// (pitch, onset in microseconds) -> note
    by_pitch_onset: BTreeMap<(u8, i64), NoteId>,
    tracks: Vec<TrackFeatures>,
    stats: FeatureStats,
}

fn onset_key(onset: f64) -> i64 {
    (onset * 1e6).round() as i64
}

impl FeatureSet {
    /// Assemble a feature set from per-note features, in transcription order
    pub fn from_notes(midi: &Transcription, notes: Vec<(NoteId, NoteFeatures)>) -> Self {
        let mut by_pitch_onset = BTreeMap::new();
        for (track, index, note) in midi.notes_with_track() {
            by_pitch_onset
                .entry((note.pitch, onset_key(note.onset)))
                .or_insert(NoteId { track, index });
        }
        let notes: BTreeMap<NoteId, NoteFeatures> = notes.into_iter().collect();

        let tracks: Vec<TrackFeatures> = midi
            .instruments
            .iter()
            .enumerate()
            .map(|(t, inst)| {
                let feats: Vec<&NoteFeatures> = (0..inst.notes.len())
                    .filter_map(|index| notes.get(&NoteId { track: t, index }))
                    .collect();
                let decays: Vec<f64> = feats.iter().filter_map(|f| f.fitted_decay()).collect();
                let centroids: Vec<f64> = feats
                    .iter()
                    .filter(|f| f.has_timbre())
                    .map(|f| f.spectral_centroid)
                    .collect();
                TrackFeatures {
                    program: inst.program,
                    is_drum: inst.is_drum,
                    note_count: inst.notes.len(),
                    fitted_notes: decays.len(),
                    decay_constant: median(&decays),
                    spectral_centroid: (!centroids.is_empty())
                        .then(|| crate::audio::mean(&centroids)),
                    timbre_observations: centroids.len(),
                    success_rate: if inst.notes.is_empty() {
                        0.0
                    } else {
                        decays.len() as f64 / inst.notes.len() as f64
                    },
                }
            })
            .collect();

        let mut failures = BTreeMap::new();
        for f in notes.values() {
            if let Some(reason) = f.failure {
                *failures.entry(reason).or_insert(0) += 1;
            }
        }
        let notes_processed = notes.len();
        let notes_succeeded = notes.values().filter(|f| f.extraction_success).count();
        let stats = FeatureStats {
            notes_processed,
            notes_succeeded,
            instruments_processed: tracks.iter().filter(|t| t.note_count > 0).count(),
            prony_success_rates: tracks
                .iter()
                .filter(|t| t.note_count > 0)
                .map(|t| t.success_rate)
                .collect(),
            overall_success_rate: if notes_processed == 0 {
                0.0
            } else {
                notes_succeeded as f64 / notes_processed as f64
            },
            failures,
        };

        Self {
            notes,
            by_pitch_onset,
            tracks,
            stats,
        }
    }

    pub fn get(&self, id: NoteId) -> Option<&NoteFeatures> {
        self.notes.get(&id)
    }

    /// Features of the note that had this pitch and onset at extraction time
    pub fn lookup(&self, note: &Note) -> Option<&NoteFeatures> {
        self.by_pitch_onset
            .get(&(note.pitch, onset_key(note.onset)))
            .and_then(|id| self.notes.get(id))
    }

    pub fn track(&self, track: usize) -> Option<&TrackFeatures> {
        self.tracks.get(track)
    }

    pub fn tracks(&self) -> &[TrackFeatures] {
        &self.tracks
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NoteId, &NoteFeatures)> {
        self.notes.iter()
    }

    pub fn len(&self) -> usize {
        self.notes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notes.is_empty()
    }

    pub fn stats(&self) -> &FeatureStats {
        &self.stats
    }
}

/// Default extractor: first-order Prony fit on the RMS envelope
#[derive(Debug, Clone, Copy, Default)]
pub struct PronyExtractor;

impl FeatureExtractor for PronyExtractor {
    fn extract(
        &self,
        midi: &Transcription,
        audio: &[f32],
        sample_rate: u32,
        config: &EnhancementConfig,
    ) -> Result<FeatureSet, FeatureError> {
        run(midi, audio, sample_rate, config)
    }
}

/// Fit a decay constant (1/s) to an envelope sampled every `hop_seconds`.
///
/// The fit starts at the envelope peak within the first quarter and uses
/// one-pole linear prediction: z = sum(e[n]e[n+1]) / sum(e[n]^2).
pub fn prony_decay(
    envelope: &[f32],
    hop_seconds: f64,
    config: &FeatureConfig,
) -> Result<f64, FitFailure> {
    if envelope.len() < config.min_fit_frames {
        return Err(FitFailure::TooShort);
    }

    let search = (envelope.len() / 4).max(1);
    let (peak_idx, peak) = envelope[..search]
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap_or((0, 0.0));
    if peak < config.min_peak_rms {
        return Err(FitFailure::TooQuiet);
    }

    let tail = &envelope[peak_idx..];
    if tail.len() < config.min_fit_frames {
        return Err(FitFailure::TooShort);
    }

    let mut cross = 0.0f64;
    let mut energy = 0.0f64;
    for pair in tail.windows(2) {
        cross += pair[0] as f64 * pair[1] as f64;
        energy += pair[0] as f64 * pair[0] as f64;
    }
    if energy <= 0.0 {
        return Err(FitFailure::TooQuiet);
    }

    let z = cross / energy;
    if !(z > 0.0 && z < 1.0) {
        return Err(FitFailure::NotDecaying);
    }
    let k = -z.ln() / hop_seconds;
    if !k.is_finite() || k > config.max_decay_constant {
        return Err(FitFailure::NotDecaying);
    }
    Ok(k)
}

fn failed(reason: FitFailure, centroid: f64) -> NoteFeatures {
    NoteFeatures {
        decay_constant: DEFAULT_DECAY_CONSTANT,
        spectral_centroid: centroid,
        extraction_success: false,
        failure: Some(reason),
    }
}

/// Extract features for one note
fn extract_note(
    note: &Note,
    next_onset: Option<f64>,
    audio: &[f32],
    sample_rate: u32,
    config: &FeatureConfig,
    analyzer: &SpectrumAnalyzer,
) -> NoteFeatures {
    let sr = sample_rate as f64;
    let start = (note.onset * sr).round();
    if !(start >= 0.0) || start as usize >= audio.len() {
        return failed(FitFailure::OutOfRange, 0.0);
    }
    let start = start as usize;

    let mut window_end = note.onset + config.decay_window_seconds;
    if let Some(next) = next_onset {
        window_end = window_end.min(next);
    }
    let end = ((window_end * sr).round() as usize).clamp(start, audio.len());

    let centroid = analyzer.centroid(&audio[start..end]) as f64;

    let hop = ((config.envelope_hop_seconds * sr).round() as usize).max(1);
    let envelope = rms_envelope(&audio[start..end], hop * 2, hop);

    match prony_decay(&envelope, hop as f64 / sr, config) {
        Ok(k) => NoteFeatures {
            decay_constant: k,
            spectral_centroid: centroid,
            extraction_success: true,
            failure: None,
        },
        Err(reason) => failed(reason, centroid),
    }
}

/// Run Pass 1: extract decay and timbre features for every note
pub fn run(
    midi: &Transcription,
    audio: &[f32],
    sample_rate: u32,
    config: &EnhancementConfig,
) -> Result<FeatureSet, FeatureError> {
    let cfg = &config.features;

    if sample_rate == 0 {
        return Err(FeatureError::Extraction("sample rate is zero".to_string()));
    }
    if audio.is_empty() {
        return Err(FeatureError::Extraction("audio is empty".to_string()));
    }
    if cfg.n_fft < 2 {
        return Err(FeatureError::Extraction(format!(
            "invalid FFT size {}",
            cfg.n_fft
        )));
    }

    let jobs: Vec<(NoteId, Note)> = midi
        .notes_with_track()
        .map(|(track, index, note)| (NoteId { track, index }, *note))
        .collect();
    if jobs.is_empty() {
        return Err(FeatureError::Extraction(
            "transcription has no notes".to_string(),
        ));
    }

    let onsets = midi.sorted_onsets();
    let next_onset = |onset: f64| -> Option<f64> {
        let pos = onsets.partition_point(|&o| o <= onset);
        onsets.get(pos).copied()
    };

    let analyzer = SpectrumAnalyzer::new(cfg.n_fft, sample_rate);
    let fit = |(id, note): &(NoteId, Note)| {
        (
            *id,
            extract_note(note, next_onset(note.onset), audio, sample_rate, cfg, &analyzer),
        )
    };

    // Results are collected in note order before the set is assembled
    let results: Vec<(NoteId, NoteFeatures)> = if cfg.parallel {
        jobs.par_iter().map(fit).collect()
    } else {
        jobs.iter().map(fit).collect()
    };

    let features = FeatureSet::from_notes(midi, results);
    let stats = features.stats();

    for (reason, count) in &stats.failures {
        debug!(?reason, count, "decay fit failures");
    }

    let failed_count = stats.notes_processed - stats.notes_succeeded;
    if failed_count as f64 / stats.notes_processed as f64 > cfg.systemic_failure_ratio {
        warn!(
            failed = failed_count,
            total = stats.notes_processed,
            "majority of decay fits failed"
        );
        return Err(FeatureError::SystemicDecayFailure {
            failed: failed_count,
            total: stats.notes_processed,
        });
    }

    info!(
        notes = stats.notes_processed,
        succeeded = stats.notes_succeeded,
        instruments = stats.instruments_processed,
        success_rate = format!("{:.2}", stats.overall_success_rate),
        "features extracted"
    );

    Ok(features)
}
