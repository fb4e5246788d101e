//! Pass 4: Metrics & Evaluation
//!
//! `compute_metrics` is the before/after summary every run reports. The
//! rest of the module scores transcriptions for `compare_enhancement`:
//! onset fragmentation, note durations, audio coverage and note-level
//! precision/recall against a reference.

use crate::config::EvaluationConfig;
use crate::error::{EnhanceError, Result};
use crate::transcription::{Note, Transcription};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Before/after counts for one enhancement run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementMetrics {
    pub instruments_original: usize,
    pub instruments_enhanced: usize,
    pub reduction_count: i64,
    /// 0.0 when the original has no instruments
    pub reduction_percent: f64,
    pub notes_original: usize,
    pub notes_enhanced: usize,
    pub notes_reduction_count: i64,
    pub notes_reduction_percent: f64,
}

/// Percentage of `before` removed, 0.0 when `before` is zero
pub fn reduction_percent(before: usize, after: usize) -> f64 {
    if before == 0 {
        return 0.0;
    }
    (before as f64 - after as f64) * 100.0 / before as f64
}

/// Compare instrument and note counts of two transcriptions
pub fn compute_metrics(original: &Transcription, enhanced: &Transcription) -> EnhancementMetrics {
    let instruments_original = original.instrument_count();
    let instruments_enhanced = enhanced.instrument_count();
    let notes_original = original.total_notes();
    let notes_enhanced = enhanced.total_notes();

    EnhancementMetrics {
        instruments_original,
        instruments_enhanced,
        reduction_count: instruments_original as i64 - instruments_enhanced as i64,
        reduction_percent: reduction_percent(instruments_original, instruments_enhanced),
        notes_original,
        notes_enhanced,
        notes_reduction_count: notes_original as i64 - notes_enhanced as i64,
        notes_reduction_percent: reduction_percent(notes_original, notes_enhanced),
    }
}

/// Run Pass 4: compute metrics and reject non-finite results
pub fn run(original: &Transcription, enhanced: &Transcription) -> Result<EnhancementMetrics> {
    let metrics = compute_metrics(original, enhanced);
    if !metrics.reduction_percent.is_finite() || !metrics.notes_reduction_percent.is_finite() {
        return Err(EnhanceError::Metrics(format!(
            "non-finite reduction percentage ({}, {})",
            metrics.reduction_percent, metrics.notes_reduction_percent
        )));
    }
    Ok(metrics)
}

/// Same-pitch re-onsets that follow the previous note within the window
pub fn onset_fragmentation(midi: &Transcription, window_seconds: f64) -> usize {
    let mut repeated = 0;
    for inst in &midi.instruments {
        let mut by_pitch: BTreeMap<u8, Vec<&Note>> = BTreeMap::new();
        for note in &inst.notes {
            by_pitch.entry(note.pitch).or_default().push(note);
        }
        for notes in by_pitch.values_mut() {
            notes.sort_by(|a, b| a.onset.total_cmp(&b.onset));
            repeated += notes
                .windows(2)
                .filter(|pair| pair[1].onset - pair[0].offset <= window_seconds)
                .count();
        }
    }
    repeated
}

pub fn mean_note_duration(midi: &Transcription) -> f64 {
    let durations: Vec<f64> = midi
        .notes_with_track()
        .map(|(_, _, note)| note.duration())
        .collect();
    crate::audio::mean(&durations)
}

/// Fraction of the audio covered by at least one note
pub fn audio_coverage(midi: &Transcription, audio_duration: f64) -> f64 {
    if !(audio_duration > 0.0) {
        return 0.0;
    }
    let mut spans: Vec<(f64, f64)> = midi
        .notes_with_track()
        .map(|(_, _, n)| (n.onset.max(0.0), n.offset.min(audio_duration)))
        .filter(|(a, b)| b > a)
        .collect();
    spans.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut covered = 0.0;
    let mut current: Option<(f64, f64)> = None;
    for (start, end) in spans {
        current = match current {
            Some((s, e)) if start <= e => Some((s, e.max(end))),
            Some((s, e)) => {
                covered += e - s;
                Some((start, end))
            }
            None => Some((start, end)),
        };
    }
    if let Some((s, e)) = current {
        covered += e - s;
    }
    (covered / audio_duration).clamp(0.0, 1.0)
}

/// Note-level precision/recall against a reference transcription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteScores {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub matched: usize,
    pub estimated: usize,
    pub reference: usize,
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Match notes one-to-one on pitch and onset within `tolerance`.
///
/// Reference notes are visited in onset order and each takes the closest
/// unmatched estimate.
pub fn note_scores(
    estimate: &Transcription,
    reference: &Transcription,
    tolerance: f64,
) -> NoteScores {
    let mut pool: BTreeMap<u8, Vec<(f64, bool)>> = BTreeMap::new();
    for (_, _, note) in estimate.notes_with_track() {
        let candidates = pool.entry(note.pitch).or_default();
        candidates.push((note.onset, false));
    }
    for candidates in pool.values_mut() {
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
    }

    let mut refs: Vec<&Note> = reference.notes_with_track().map(|(_, _, n)| n).collect();
    // Stable, so equal onsets stay in pitch order
    refs.sort_by_key(|n| n.pitch);
    refs.sort_by(|a, b| a.onset.total_cmp(&b.onset));

    let mut matched = 0;
    for r in refs {
        let Some(candidates) = pool.get_mut(&r.pitch) else {
            continue;
        };
        let best = candidates
            .iter()
            .enumerate()
            .filter(|(_, (onset, used))| !used && (onset - r.onset).abs() <= tolerance)
            .min_by(|a, b| {
                (a.1 .0 - r.onset)
                    .abs()
                    .total_cmp(&(b.1 .0 - r.onset).abs())
                    .then(a.0.cmp(&b.0))
            })
            .map(|(i, _)| i);
        if let Some(i) = best {
            candidates[i].1 = true;
            matched += 1;
        }
    }

    let estimated = estimate.total_notes();
    let reference_count = reference.total_notes();
    let precision = ratio(matched, estimated);
    let recall = ratio(matched, reference_count);
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    NoteScores {
        precision,
        recall,
        f1,
        matched,
        estimated,
        reference: reference_count,
    }
}

/// Quality indicators of one transcription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    pub repeated_onsets: usize,
    pub fragmentation_rate: f64,
    pub mean_note_duration: f64,
    pub audio_coverage: f64,
}

impl QualityMetrics {
    pub fn measure(midi: &Transcription, audio_duration: f64, config: &EvaluationConfig) -> Self {
        let repeated_onsets = onset_fragmentation(midi, config.fragmentation_window_seconds);
        let total = midi.total_notes();
        Self {
            repeated_onsets,
            fragmentation_rate: if total == 0 {
                0.0
            } else {
                repeated_onsets as f64 / total as f64
            },
            mean_note_duration: mean_note_duration(midi),
            audio_coverage: audio_coverage(midi, audio_duration),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroundTruthComparison {
    pub original: NoteScores,
    pub enhanced: NoteScores,
    pub precision_delta: f64,
    pub recall_delta: f64,
    pub f1_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementComparison {
    pub notes_original: usize,
    pub notes_enhanced: usize,
    pub note_reduction: i64,
    pub note_reduction_percent: f64,
    pub instruments_original: usize,
    pub instruments_enhanced: usize,
    pub original_quality: QualityMetrics,
    pub enhanced_quality: QualityMetrics,
    pub ground_truth: Option<GroundTruthComparison>,
}

/// Score an original and an enhanced transcription side by side
pub fn compare(
    original: &Transcription,
    enhanced: &Transcription,
    audio_duration: f64,
    ground_truth: Option<&Transcription>,
    config: &EvaluationConfig,
) -> EnhancementComparison {
    let metrics = compute_metrics(original, enhanced);
    let ground_truth = ground_truth.map(|reference| {
        let before = note_scores(original, reference, config.onset_tolerance_seconds);
        let after = note_scores(enhanced, reference, config.onset_tolerance_seconds);
        GroundTruthComparison {
            precision_delta: after.precision - before.precision,
            recall_delta: after.recall - before.recall,
            f1_delta: after.f1 - before.f1,
            original: before,
            enhanced: after,
        }
    });

    EnhancementComparison {
        notes_original: metrics.notes_original,
        notes_enhanced: metrics.notes_enhanced,
        note_reduction: metrics.notes_reduction_count,
        note_reduction_percent: metrics.notes_reduction_percent,
        instruments_original: metrics.instruments_original,
        instruments_enhanced: metrics.instruments_enhanced,
        original_quality: QualityMetrics::measure(original, audio_duration, config),
        enhanced_quality: QualityMetrics::measure(enhanced, audio_duration, config),
        ground_truth,
    }
}
