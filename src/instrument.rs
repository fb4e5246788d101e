//! General-MIDI instrument families and their expected timbre

use serde::{Deserialize, Serialize};

/// The sixteen General-MIDI program families (eight programs each)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentFamily {
    Piano,
    ChromaticPercussion,
    Organ,
    Guitar,
    Bass,
    Strings,
    Ensemble,
    Brass,
    Reed,
    Pipe,
    SynthLead,
    SynthPad,
    SynthEffects,
    Ethnic,
    Percussive,
    SoundEffects,
}

/// Expected spectral centroid band (Hz) and decay band (1/s) for a family
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimbreProfile {
    pub centroid_hz: (f64, f64),
    pub decay_per_sec: (f64, f64),
    pub default_program: u8,
}

impl InstrumentFamily {
    pub const ALL: [InstrumentFamily; 16] = [
        InstrumentFamily::Piano,
        InstrumentFamily::ChromaticPercussion,
        InstrumentFamily::Organ,
        InstrumentFamily::Guitar,
        InstrumentFamily::Bass,
        InstrumentFamily::Strings,
        InstrumentFamily::Ensemble,
        InstrumentFamily::Brass,
        InstrumentFamily::Reed,
        InstrumentFamily::Pipe,
        InstrumentFamily::SynthLead,
        InstrumentFamily::SynthPad,
        InstrumentFamily::SynthEffects,
        InstrumentFamily::Ethnic,
        InstrumentFamily::Percussive,
        InstrumentFamily::SoundEffects,
    ];

    pub fn from_program(program: u8) -> Self {
        Self::ALL[(program.min(127) / 8) as usize]
    }

    pub fn name(&self) -> &'static str {
        match self {
            InstrumentFamily::Piano => "Piano",
            InstrumentFamily::ChromaticPercussion => "Chromatic Percussion",
            InstrumentFamily::Organ => "Organ",
            InstrumentFamily::Guitar => "Guitar",
            InstrumentFamily::Bass => "Bass",
            InstrumentFamily::Strings => "Strings",
            InstrumentFamily::Ensemble => "Ensemble",
            InstrumentFamily::Brass => "Brass",
            InstrumentFamily::Reed => "Reed",
            InstrumentFamily::Pipe => "Pipe",
            InstrumentFamily::SynthLead => "Synth Lead",
            InstrumentFamily::SynthPad => "Synth Pad",
            InstrumentFamily::SynthEffects => "Synth Effects",
            InstrumentFamily::Ethnic => "Ethnic",
            InstrumentFamily::Percussive => "Percussive",
            InstrumentFamily::SoundEffects => "Sound Effects",
        }
    }

    /// Whether the refiner may move a track into this family
    pub fn is_reassignable_target(&self) -> bool {
        !matches!(self, InstrumentFamily::SoundEffects)
    }

    pub fn timbre(&self) -> TimbreProfile {
        let (centroid_hz, decay_per_sec, default_program) = match self {
            InstrumentFamily::Piano => ((400.0, 2000.0), (1.0, 8.0), 0),
            InstrumentFamily::ChromaticPercussion => ((800.0, 4000.0), (4.0, 30.0), 11),
            InstrumentFamily::Organ => ((300.0, 2500.0), (0.0, 1.5), 16),
            InstrumentFamily::Guitar => ((400.0, 2500.0), (1.5, 10.0), 24),
            InstrumentFamily::Bass => ((60.0, 600.0), (1.0, 8.0), 33),
            InstrumentFamily::Strings => ((400.0, 2500.0), (0.0, 2.0), 40),
            InstrumentFamily::Ensemble => ((400.0, 3000.0), (0.0, 2.0), 48),
            InstrumentFamily::Brass => ((500.0, 3000.0), (0.0, 2.0), 56),
            InstrumentFamily::Reed => ((400.0, 3000.0), (0.0, 2.0), 65),
            InstrumentFamily::Pipe => ((600.0, 4000.0), (0.0, 2.0), 73),
            InstrumentFamily::SynthLead => ((800.0, 5000.0), (0.0, 3.0), 80),
            InstrumentFamily::SynthPad => ((300.0, 2000.0), (0.0, 1.5), 88),
            InstrumentFamily::SynthEffects => ((500.0, 5000.0), (0.0, 5.0), 96),
            InstrumentFamily::Ethnic => ((400.0, 3000.0), (1.0, 10.0), 104),
            InstrumentFamily::Percussive => ((500.0, 6000.0), (5.0, 40.0), 113),
            InstrumentFamily::SoundEffects => ((200.0, 8000.0), (0.0, 40.0), 120),
        };
        TimbreProfile {
            centroid_hz,
            decay_per_sec,
            default_program,
        }
    }
}

impl TimbreProfile {
    /// Octaves by which `centroid` falls outside the expected band (0 inside)
    pub fn centroid_distance(&self, centroid: f64) -> f64 {
        let (lo, hi) = self.centroid_hz;
        let c = centroid.max(1.0);
        if c < lo {
            (lo / c).log2()
        } else if c > hi {
            (c / hi).log2()
        } else {
            0.0
        }
    }

    /// Octave-scale distance of a decay constant from the expected band
    pub fn decay_distance(&self, decay: f64) -> f64 {
        const FLOOR: f64 = 0.25;
        let (lo, hi) = self.decay_per_sec;
        let d = decay.max(FLOOR);
        if d < lo {
            (lo.max(FLOOR) / d).log2()
        } else if d > hi {
            (d / hi.max(FLOOR)).log2()
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_family_from_program() {
        assert_eq!(InstrumentFamily::from_program(0), InstrumentFamily::Piano);
        assert_eq!(InstrumentFamily::from_program(33), InstrumentFamily::Bass);
        assert_eq!(InstrumentFamily::from_program(127), InstrumentFamily::SoundEffects);
    }

    #[test]
    fn test_default_programs_stay_in_family() {
        for family in InstrumentFamily::ALL {
            let program = family.timbre().default_program;
            assert_eq!(InstrumentFamily::from_program(program), family);
        }
    }

    #[test]
    fn test_centroid_distance() {
        let bass = InstrumentFamily::Bass.timbre();
        assert_eq!(bass.centroid_distance(200.0), 0.0);
        assert!((bass.centroid_distance(1200.0) - 1.0).abs() < 1e-9);
        assert!((bass.centroid_distance(30.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_decay_distance() {
        let organ = InstrumentFamily::Organ.timbre();
        assert_eq!(organ.decay_distance(0.5), 0.0);
        assert!((organ.decay_distance(6.0) - 2.0).abs() < 1e-9);
    }
}
