//! Transcription data model: instrument tracks and their notes

use crate::instrument::InstrumentFamily;
use serde::{Deserialize, Serialize};

/// A single transcribed note, times in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub pitch: u8,
    pub onset: f64,
    pub offset: f64,
    pub velocity: u8,
}

impl Note {
    pub fn new(pitch: u8, onset: f64, offset: f64, velocity: u8) -> Self {
        Self {
            pitch,
            onset,
            offset,
            velocity,
        }
    }

    pub fn duration(&self) -> f64 {
        self.offset - self.onset
    }

    /// Pitch, onset and offset are in range and the note has positive length
    pub fn is_well_formed(&self) -> bool {
        self.pitch <= 127
            && self.velocity <= 127
            && self.onset.is_finite()
            && self.offset.is_finite()
            && self.onset >= 0.0
            && self.offset > self.onset
    }
}

/// One instrument assignment with the notes it owns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentTrack {
    /// General-MIDI program number (0-127), ignored for drum tracks
    pub program: u8,
    pub is_drum: bool,
    pub name: String,
    pub notes: Vec<Note>,
}

impl InstrumentTrack {
    pub fn new(program: u8, is_drum: bool) -> Self {
        let name = if is_drum {
            "Drums".to_string()
        } else {
            InstrumentFamily::from_program(program).name().to_string()
        };
        Self {
            program,
            is_drum,
            name,
            notes: Vec::new(),
        }
    }

    pub fn with_notes(program: u8, is_drum: bool, notes: Vec<Note>) -> Self {
        let mut track = Self::new(program, is_drum);
        track.notes = notes;
        track
    }

    pub fn first_onset(&self) -> Option<f64> {
        self.notes.iter().map(|n| n.onset).min_by(f64::total_cmp)
    }

    pub fn end_time(&self) -> f64 {
        self.notes.iter().map(|n| n.offset).fold(0.0, f64::max)
    }

    /// Sort notes by onset, then pitch
    pub fn sort_notes(&mut self) {
        self.notes.sort_by(|a, b| {
            a.onset
                .total_cmp(&b.onset)
                .then(a.pitch.cmp(&b.pitch))
                .then(a.offset.total_cmp(&b.offset))
        });
    }
}

/// An ordered collection of instrument tracks
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub instruments: Vec<InstrumentTrack>,
}

impl Transcription {
    pub fn new(instruments: Vec<InstrumentTrack>) -> Self {
        Self { instruments }
    }

    pub fn total_notes(&self) -> usize {
        self.instruments.iter().map(|i| i.notes.len()).sum()
    }

    pub fn instrument_count(&self) -> usize {
        self.instruments.len()
    }

    /// Latest note offset across all tracks
    pub fn end_time(&self) -> f64 {
        self.instruments
            .iter()
            .map(InstrumentTrack::end_time)
            .fold(0.0, f64::max)
    }

    /// All onset times in ascending order
    pub fn sorted_onsets(&self) -> Vec<f64> {
        let mut onsets: Vec<f64> = self
            .instruments
            .iter()
            .flat_map(|i| i.notes.iter().map(|n| n.onset))
            .collect();
        onsets.sort_by(f64::total_cmp);
        onsets
    }

    /// Iterate over every note together with its owning track index
    pub fn notes_with_track(&self) -> impl Iterator<Item = (usize, usize, &Note)> {
        self.instruments
            .iter()
            .enumerate()
            .flat_map(|(t, inst)| inst.notes.iter().enumerate().map(move |(i, n)| (t, i, n)))
    }
}
