//! Pass 2: Decay-Based Consolidation
//!
//! Two phases. First, instrument tracks whose decay signatures (and,
//! under the conservative strategy, spectral centroids) agree are merged,
//! best-matching pair first, until no pair qualifies. Then, inside every
//! track, same-pitch fragments separated by a small gap are rejoined into
//! one sustained note when their decays match.
//!
//! When the extractor's success rate is too low to trust decay evidence
//! the pass runs in fallback mode: no instrument merges, and fragments
//! are rejoined only across the tight fallback gap.

use crate::config::{ConsolidationStrategy, EnhancementConfig};
use crate::error::{EnhanceError, Result};
use crate::passes::pass_1::FeatureSet;
use crate::passes::Consolidator;
use crate::transcription::{InstrumentTrack, Note, Transcription};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, info, warn};

/// One instrument merge, in the order it was applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeEvent {
    pub iteration: usize,
    /// Original track indices of the surviving and the absorbed group
    pub merged: (usize, usize),
    pub decay_similarity: f64,
    /// Centroid distance in Hz, absent when either side had no timbre
    pub spectral_distance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationStats {
    pub strategy: ConsolidationStrategy,
    pub fallback_mode: bool,
    pub input_instruments: usize,
    pub output_instruments: usize,
    pub merges_performed: usize,
    pub fragment_merges: usize,
    pub total_merged: usize,
    /// Fraction of instrument tracks removed
    pub reduction_rate: f64,
    pub notes_before: usize,
    pub notes_after: usize,
    pub decay_threshold: f64,
    pub spectral_threshold: f64,
    pub merge_history: Vec<MergeEvent>,
}

/// Default consolidator
#[derive(Debug, Clone, Copy, Default)]
pub struct DecayConsolidator;

impl Consolidator for DecayConsolidator {
    fn consolidate(
        &self,
        midi: &Transcription,
        features: &FeatureSet,
        config: &EnhancementConfig,
    ) -> Result<(Transcription, ConsolidationStats)> {
        run(midi, features, config)
    }
}

/// A set of original tracks being consolidated into one
#[derive(Debug, Clone)]
struct Group {
    /// Original index of the first member
    origin: usize,
    track: InstrumentTrack,
    decay: Option<f64>,
    centroid: Option<f64>,
    first_onset: f64,
}

impl Group {
    fn absorb(&mut self, other: Group) {
        let n_self = self.track.notes.len();
        let n_other = other.track.notes.len();
        let total = (n_self + n_other).max(1) as f64;

        self.decay = weighted(self.decay, n_self, other.decay, n_other, total);
        self.centroid = weighted(self.centroid, n_self, other.centroid, n_other, total);

        // Program of the larger group survives
        if n_other > n_self {
            self.track.program = other.track.program;
            self.track.name = other.track.name.clone();
        }
        self.first_onset = self.first_onset.min(other.first_onset);
        self.track.notes.extend(other.track.notes);
        self.track.sort_notes();
    }
}

fn weighted(a: Option<f64>, na: usize, b: Option<f64>, nb: usize, total: f64) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some((a * na as f64 + b * nb as f64) / total),
        (a, None) => a,
        (None, b) => b,
    }
}

/// min/max ratio of two decay constants, 1.0 for identical decays
pub fn decay_similarity(a: f64, b: f64) -> f64 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    if hi <= 0.0 || !lo.is_finite() || !hi.is_finite() {
        return 0.0;
    }
    (lo / hi).clamp(0.0, 1.0)
}

struct Candidate {
    i: usize,
    j: usize,
    similarity: f64,
    spectral_distance: Option<f64>,
    earliest_onset: f64,
}

impl Candidate {
    /// Best first: highest similarity, then earliest onset, then lowest indices
    fn rank(&self, other: &Candidate) -> Ordering {
        other
            .similarity
            .total_cmp(&self.similarity)
            .then(self.earliest_onset.total_cmp(&other.earliest_onset))
            .then((self.i, self.j).cmp(&(other.i, other.j)))
    }
}

fn best_candidate(groups: &[Group], config: &EnhancementConfig) -> Option<Candidate> {
    let c = &config.consolidation;
    let mut best: Option<Candidate> = None;

    for i in 0..groups.len() {
        for j in (i + 1)..groups.len() {
            let (a, b) = (&groups[i], &groups[j]);
            if a.track.is_drum != b.track.is_drum {
                continue;
            }
            let (Some(da), Some(db)) = (a.decay, b.decay) else {
                continue;
            };
            let similarity = decay_similarity(da, db);
            if similarity < c.decay_threshold {
                continue;
            }
            let spectral_distance = match (a.centroid, b.centroid) {
                (Some(ca), Some(cb)) => Some((ca - cb).abs()),
                _ => None,
            };
            if c.strategy == ConsolidationStrategy::Conservative
                && !spectral_distance.is_some_and(|d| d <= c.spectral_threshold)
            {
                continue;
            }

            let candidate = Candidate {
                i,
                j,
                similarity,
                spectral_distance,
                earliest_onset: a.first_onset.min(b.first_onset),
            };
            let better = best
                .as_ref()
                .map_or(true, |current| candidate.rank(current) == Ordering::Less);
            if better {
                best = Some(candidate);
            }
        }
    }
    best
}

/// Merge instrument groups until no pair qualifies
fn merge_instruments(
    groups: &mut Vec<Group>,
    config: &EnhancementConfig,
) -> Vec<MergeEvent> {
    let mut history = Vec::new();
    let cap = config.consolidation.max_merges.unwrap_or(usize::MAX);

    while history.len() < cap {
        let Some(candidate) = best_candidate(groups, config) else {
            break;
        };

        // The later group is absorbed into the earlier one
        let (keep, gone) = {
            let (a, b) = (&groups[candidate.i], &groups[candidate.j]);
            if b.first_onset < a.first_onset {
                (candidate.j, candidate.i)
            } else {
                (candidate.i, candidate.j)
            }
        };
        let absorbed = groups.remove(gone);
        let keep = if gone < keep { keep - 1 } else { keep };

        let event = MergeEvent {
            iteration: history.len() + 1,
            merged: (groups[keep].origin, absorbed.origin),
            decay_similarity: candidate.similarity,
            spectral_distance: candidate.spectral_distance,
        };
        debug!(
            iteration = event.iteration,
            into = event.merged.0,
            from = event.merged.1,
            similarity = format!("{:.3}", event.decay_similarity),
            "merged instrument tracks"
        );
        groups[keep].absorb(absorbed);
        history.push(event);
    }

    history
}

/// Rejoin same-pitch fragments within one track; returns the number of joins
fn merge_fragments(
    track: &mut InstrumentTrack,
    features: &FeatureSet,
    config: &EnhancementConfig,
    fallback_mode: bool,
) -> usize {
    let c = &config.consolidation;
    let mut notes = std::mem::take(&mut track.notes);
    notes.sort_by(|a, b| {
        a.pitch
            .cmp(&b.pitch)
            .then(a.onset.total_cmp(&b.onset))
            .then(a.offset.total_cmp(&b.offset))
    });

    let mut merged: Vec<Note> = Vec::with_capacity(notes.len());
    let mut joins = 0usize;

    for note in notes {
        if let Some(prev) = merged.last_mut() {
            if prev.pitch == note.pitch {
                let gap = note.onset - prev.offset;
                let decays = features
                    .lookup(prev)
                    .and_then(|f| f.fitted_decay())
                    .zip(features.lookup(&note).and_then(|f| f.fitted_decay()));

                let joinable = match decays {
                    Some((a, b)) if !fallback_mode => {
                        gap <= c.fragment_gap_seconds
                            && decay_similarity(a, b) >= c.decay_threshold
                    }
                    _ => gap <= c.fallback_gap_seconds,
                };

                if joinable {
                    prev.offset = prev.offset.max(note.offset);
                    prev.velocity = prev.velocity.max(note.velocity);
                    joins += 1;
                    continue;
                }
            }
        }
        merged.push(note);
    }

    track.notes = merged;
    track.sort_notes();
    joins
}

/// Run Pass 2: consolidate fragmented notes and duplicate instrument tracks
pub fn run(
    midi: &Transcription,
    features: &FeatureSet,
    config: &EnhancementConfig,
) -> Result<(Transcription, ConsolidationStats)> {
    let c = &config.consolidation;

    if features.tracks().len() != midi.instruments.len() {
        return Err(EnhanceError::Consolidation(format!(
            "features cover {} tracks but transcription has {}",
            features.tracks().len(),
            midi.instruments.len()
        )));
    }

    let success_rate = features.stats().overall_success_rate;
    let fallback_mode = success_rate < c.min_feature_success_rate;
    if fallback_mode {
        warn!(
            success_rate = format!("{:.2}", success_rate),
            threshold = c.min_feature_success_rate,
            "decay features unreliable, consolidating in fallback mode"
        );
    }

    let mut groups: Vec<Group> = midi
        .instruments
        .iter()
        .enumerate()
        .map(|(t, inst)| {
            let track_features = features.track(t);
            Group {
                origin: t,
                track: inst.clone(),
                decay: track_features.and_then(|f| f.decay_constant),
                centroid: track_features.and_then(|f| f.spectral_centroid),
                first_onset: inst.first_onset().unwrap_or(f64::INFINITY),
            }
        })
        .collect();

    let merge_history = if fallback_mode {
        Vec::new()
    } else {
        merge_instruments(&mut groups, config)
    };

    let mut fragment_merges = 0usize;
    let mut instruments = Vec::with_capacity(groups.len());
    for mut group in groups {
        fragment_merges += merge_fragments(&mut group.track, features, config, fallback_mode);
        instruments.push(group.track);
    }
    let consolidated = Transcription::new(instruments);

    let input_instruments = midi.instrument_count();
    let output_instruments = consolidated.instrument_count();
    let merges_performed = merge_history.len();
    let stats = ConsolidationStats {
        strategy: c.strategy,
        fallback_mode,
        input_instruments,
        output_instruments,
        merges_performed,
        fragment_merges,
        total_merged: merges_performed + fragment_merges,
        reduction_rate: if input_instruments == 0 {
            0.0
        } else {
            (input_instruments - output_instruments) as f64 / input_instruments as f64
        },
        notes_before: midi.total_notes(),
        notes_after: consolidated.total_notes(),
        decay_threshold: c.decay_threshold,
        spectral_threshold: c.spectral_threshold,
        merge_history,
    };

    info!(
        instruments_before = stats.input_instruments,
        instruments_after = stats.output_instruments,
        notes_before = stats.notes_before,
        notes_after = stats.notes_after,
        fragment_merges = stats.fragment_merges,
        fallback = stats.fallback_mode,
        "consolidation complete"
    );

    Ok((consolidated, stats))
}
