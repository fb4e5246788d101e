//! Pass 3: Timbre Refinement

use crate::audio::{mean, median};
use crate::config::{EnhancementConfig, RefinementConfig};
use crate::error::{EnhanceError, Result};
use crate::instrument::InstrumentFamily;
use crate::passes::pass_1::FeatureSet;
use crate::passes::Refiner;
use crate::transcription::{InstrumentTrack, Transcription};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use tracing::{debug, info};

/// Weight of the decay term relative to the centroid term
const DECAY_WEIGHT: f64 = 0.5;

/// Final program of one melodic track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgramAssignment {
    pub track: usize,
    pub program: u8,
}

/// A program change applied to one track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reassignment {
    pub track: usize,
    pub from_program: u8,
    pub to_program: u8,
    pub from_family: InstrumentFamily,
    pub to_family: InstrumentFamily,
    pub score_before: f64,
    pub score_after: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementReport {
    /// Final program of every melodic track, in track order
    pub program_assignments: Vec<ProgramAssignment>,
    pub reassignments: Vec<Reassignment>,
    pub durations_adjusted: usize,
    /// Program reassignments plus duration adjustments
    pub total_refinements: usize,
    /// Tracks not judged for reassignment (drums or too little timbre evidence)
    pub tracks_skipped: usize,
    pub summary: String,
}

/// Default refiner
#[derive(Debug, Clone, Copy, Default)]
pub struct TimbreRefiner;

impl Refiner for TimbreRefiner {
    fn refine(
        &self,
        midi: &Transcription,
        audio: &[f32],
        sample_rate: u32,
        config: &EnhancementConfig,
        features: &FeatureSet,
    ) -> Result<(Transcription, RefinementReport)> {
        run(midi, audio, sample_rate, config, features)
    }
}

/// Aggregate timbre of a track, gathered from the features of its notes
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackTimbre {
    pub centroid: f64,
    pub decay: Option<f64>,
    pub observations: usize,
}

fn track_timbre(track: &InstrumentTrack, features: &FeatureSet) -> Option<TrackTimbre> {
    let mut centroids = Vec::new();
    let mut decays = Vec::new();
    for note in &track.notes {
        if let Some(f) = features.lookup(note) {
            if f.has_timbre() {
                centroids.push(f.spectral_centroid);
            }
            if let Some(k) = f.fitted_decay() {
                decays.push(k);
            }
        }
    }
    if centroids.is_empty() {
        return None;
    }
    Some(TrackTimbre {
        centroid: mean(&centroids),
        decay: median(&decays),
        observations: centroids.len(),
    })
}

/// Mismatch between a track's timbre and a family's expected profile
pub fn family_score(family: InstrumentFamily, timbre: &TrackTimbre) -> f64 {
    let profile = family.timbre();
    let decay_term = timbre.decay.map_or(0.0, |d| profile.decay_distance(d));
    profile.centroid_distance(timbre.centroid) + DECAY_WEIGHT * decay_term
}

/// Best-matching family; ties go to the earlier family
pub fn best_family(timbre: &TrackTimbre) -> (InstrumentFamily, f64) {
    let mut best = (InstrumentFamily::Piano, f64::INFINITY);
    for family in InstrumentFamily::ALL {
        if !family.is_reassignable_target() {
            continue;
        }
        let score = family_score(family, timbre);
        if score < best.1 {
            best = (family, score);
        }
    }
    best
}

/// Time (s) for a note decaying at `k` to fall by `floor_db`
pub fn decay_implied_length(k: f64, floor_db: f64) -> f64 {
    floor_db / 20.0 * std::f64::consts::LN_10 / k
}

/// Shorten notes that ring far past their decay-implied end
fn clamp_durations(
    track: &mut InstrumentTrack,
    features: &FeatureSet,
    config: &RefinementConfig,
) -> usize {
    let mut adjusted = 0;
    for note in track.notes.iter_mut() {
        let Some(k) = features.lookup(note).and_then(|f| f.fitted_decay()) else {
            continue;
        };
        if k <= 0.0 {
            continue;
        }
        let implied = decay_implied_length(k, config.decay_floor_db);
        if note.duration() <= config.duration_tolerance * implied {
            continue;
        }
        let new_offset = note.onset + implied.max(config.min_note_duration);
        if new_offset < note.offset {
            note.offset = new_offset;
            adjusted += 1;
        }
    }
    adjusted
}

/// Run Pass 3: reassign mismatched programs and tighten note durations
pub fn run(
    midi: &Transcription,
    audio: &[f32],
    sample_rate: u32,
    config: &EnhancementConfig,
    features: &FeatureSet,
) -> Result<(Transcription, RefinementReport)> {
    let r = &config.refinement;
    if sample_rate == 0 || audio.is_empty() {
        return Err(EnhanceError::Refinement(
            "refinement needs non-empty audio".to_string(),
        ));
    }

    let mut refined = midi.clone();
    let mut program_assignments = Vec::new();
    let mut reassignments = Vec::new();
    let mut durations_adjusted = 0;
    let mut tracks_skipped = 0;

    for (t, track) in refined.instruments.iter_mut().enumerate() {
        if track.is_drum {
            tracks_skipped += 1;
            continue;
        }

        let observed = track_timbre(track, features)
            .filter(|timbre| timbre.observations >= r.min_notes);
        match observed {
            Some(timbre) => {
                let current = InstrumentFamily::from_program(track.program);
                let current_score = family_score(current, &timbre);
                let (family, score) = best_family(&timbre);

                debug!(
                    track = t,
                    centroid = format!("{:.0}", timbre.centroid),
                    current = current.name(),
                    current_score = format!("{:.2}", current_score),
                    best = family.name(),
                    best_score = format!("{:.2}", score),
                    "timbre match"
                );

                if family != current
                    && current_score > r.timbre_tolerance_octaves
                    && score + r.reassignment_margin <= current_score
                {
                    let to_program = family.timbre().default_program;
                    reassignments.push(Reassignment {
                        track: t,
                        from_program: track.program,
                        to_program,
                        from_family: current,
                        to_family: family,
                        score_before: current_score,
                        score_after: score,
                    });
                    if track.name == current.name() {
                        track.name = family.name().to_string();
                    }
                    track.program = to_program;
                }
            }
            None => tracks_skipped += 1,
        }

        if r.adjust_durations {
            durations_adjusted += clamp_durations(track, features, r);
        }
        program_assignments.push(ProgramAssignment {
            track: t,
            program: track.program,
        });
    }

    let total_refinements = reassignments.len() + durations_adjusted;
    let summary = render_summary(
        &reassignments,
        durations_adjusted,
        tracks_skipped,
        total_refinements,
    );

    info!(
        reassignments = reassignments.len(),
        durations_adjusted,
        tracks_skipped,
        "refinement complete"
    );

    Ok((
        refined,
        RefinementReport {
            program_assignments,
            reassignments,
            durations_adjusted,
            total_refinements,
            tracks_skipped,
            summary,
        },
    ))
}

fn render_summary(
    reassignments: &[Reassignment],
    durations_adjusted: usize,
    tracks_skipped: usize,
    total: usize,
) -> String {
    let mut out = String::from("Timbre refinement\n");
    let _ = writeln!(out, "  Program reassignments: {}", reassignments.len());
    for r in reassignments {
        let _ = writeln!(
            out,
            "    track {}: {} ({}) -> {} ({})",
            r.track,
            r.from_family.name(),
            r.from_program,
            r.to_family.name(),
            r.to_program
        );
    }
    let _ = writeln!(out, "  Durations adjusted: {}", durations_adjusted);
    let _ = writeln!(out, "  Tracks skipped: {}", tracks_skipped);
    let _ = write!(out, "Total refinements: {}", total);
    out
}
