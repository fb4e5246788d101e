//! MIDI import and export

use crate::error::{EnhanceError, Result};
use crate::transcription::{InstrumentTrack, Note, Transcription};
use midly::num::{u15, u24, u28, u4, u7};
use midly::{Format, Header, MetaMessage, MidiMessage, Smf, Timing, TrackEvent, TrackEventKind};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

/// Resolution used for exported files
const EXPORT_PPQ: u16 = 960;
/// 120 BPM
const EXPORT_TEMPO_USPQ: u32 = 500_000;
const DRUM_CHANNEL: u8 = 9;

/// Read a MIDI file into a transcription
pub fn read_midi<P: AsRef<Path>>(path: P) -> Result<Transcription> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|e| EnhanceError::MidiParse(format!("{}: {}", path.display(), e)))?;
    parse_midi(&bytes)
}

/// Parse MIDI bytes into a transcription.
///
/// Instruments are keyed by (track, channel, program) in order of first
/// note-on; channel 9 is percussion.
pub fn parse_midi(bytes: &[u8]) -> Result<Transcription> {
    let smf = Smf::parse(bytes)
        .map_err(|e| EnhanceError::MidiParse(e.to_string()))?;
    let clock = TickClock::from_smf(&smf);

    let mut instruments: Vec<InstrumentTrack> = Vec::new();
    let mut index: HashMap<(usize, u8, u8), usize> = HashMap::new();

    for (track_index, track) in smf.tracks.iter().enumerate() {
        let mut current_tick: u64 = 0;
        let mut programs = [0u8; 16];
        let mut track_name: Option<String> = None;
        // (channel, pitch) -> stack of (onset tick, velocity, instrument slot)
        let mut pending: HashMap<(u8, u8), Vec<(u64, u8, usize)>> = HashMap::new();
        let first_slot = instruments.len();

        for event in track {
            current_tick += event.delta.as_int() as u64;

            match event.kind {
                TrackEventKind::Meta(MetaMessage::TrackName(name)) => {
                    let name = String::from_utf8_lossy(name).trim().to_string();
                    if !name.is_empty() {
                        track_name = Some(name);
                    }
                }
                TrackEventKind::Midi { channel, message } => {
                    let ch = channel.as_int();
                    match message {
                        MidiMessage::ProgramChange { program } => {
                            programs[ch as usize] = program.as_int();
                        }
                        MidiMessage::NoteOn { key, vel } if vel.as_int() > 0 => {
                            let program = programs[ch as usize];
                            let is_drum = ch == DRUM_CHANNEL;
                            let slot = *index
                                .entry((track_index, ch, program))
                                .or_insert_with(|| {
                                    instruments.push(InstrumentTrack::new(program, is_drum));
                                    instruments.len() - 1
                                });
                            pending
                                .entry((ch, key.as_int()))
                                .or_default()
                                .push((current_tick, vel.as_int(), slot));
                        }
                        // vel=0 NoteOn is NoteOff
                        MidiMessage::NoteOff { key, .. } | MidiMessage::NoteOn { key, .. } => {
                            let pitch = key.as_int();
                            if let Some((onset, velocity, slot)) =
                                pending.get_mut(&(ch, pitch)).and_then(|stack| stack.pop())
                            {
                                push_note(
                                    &mut instruments[slot],
                                    &clock,
                                    pitch,
                                    onset,
                                    current_tick,
                                    velocity,
                                );
                            }
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        // Close any unclosed notes at the track's final tick
        let mut dangling = 0usize;
        for (&(_, pitch), stack) in pending.iter() {
            for &(onset, velocity, slot) in stack {
                dangling += 1;
                push_note(
                    &mut instruments[slot],
                    &clock,
                    pitch,
                    onset,
                    current_tick,
                    velocity,
                );
            }
        }
        if dangling > 0 {
            warn!(
                track = track_index,
                dangling,
                "closed notes without note-off at end of track"
            );
        }

        if let Some(name) = track_name {
            for inst in &mut instruments[first_slot..] {
                inst.name = name.clone();
            }
        }
    }

    instruments.retain(|inst| !inst.notes.is_empty());
    for inst in &mut instruments {
        inst.sort_notes();
    }

    debug!(
        instruments = instruments.len(),
        tracks = smf.tracks.len(),
        "parsed MIDI"
    );
    Ok(Transcription::new(instruments))
}

fn push_note(
    inst: &mut InstrumentTrack,
    clock: &TickClock,
    pitch: u8,
    onset_tick: u64,
    offset_tick: u64,
    velocity: u8,
) {
    let note = Note::new(
        pitch,
        clock.seconds(onset_tick),
        clock.seconds(offset_tick),
        velocity,
    );
    if note.is_well_formed() {
        inst.notes.push(note);
    } else {
        debug!(pitch, onset_tick, offset_tick, "dropping zero-length note");
    }
}

/// Tick to seconds conversion honoring the tempo map
struct TickClock {
    ticks_per_second: Option<f64>,
    ppq: f64,
    /// (tick, seconds at tick, microseconds per quarter)
    segments: Vec<(u64, f64, u32)>,
}

impl TickClock {
    fn from_smf(smf: &Smf) -> Self {
        let (ppq, ticks_per_second) = match smf.header.timing {
            Timing::Metrical(ticks) => (ticks.as_int().max(1) as f64, None),
            Timing::Timecode(fps, subframe) => {
                (1.0, Some((fps.as_f32() * subframe as f32).max(1.0) as f64))
            }
        };

        let mut changes: Vec<(u64, u32)> = Vec::new();
        for track in &smf.tracks {
            let mut tick: u64 = 0;
            for event in track {
                tick += event.delta.as_int() as u64;
                if let TrackEventKind::Meta(MetaMessage::Tempo(tempo)) = event.kind {
                    changes.push((tick, tempo.as_int()));
                }
            }
        }
        // Stable sort; of several changes at one tick the last one read wins
        changes.sort_by_key(|&(tick, _)| tick);

        let mut segments = vec![(0u64, 0.0f64, EXPORT_TEMPO_USPQ)];
        for (tick, uspq) in changes {
            let (last_tick, last_sec, last_uspq) = segments[segments.len() - 1];
            let sec = last_sec + (tick - last_tick) as f64 * last_uspq as f64 / (ppq * 1e6);
            if tick == last_tick {
                segments.pop();
            }
            segments.push((tick, sec, uspq));
        }

        Self {
            ticks_per_second,
            ppq,
            segments,
        }
    }

    fn seconds(&self, tick: u64) -> f64 {
        if let Some(tps) = self.ticks_per_second {
            return tick as f64 / tps;
        }
        let pos = self.segments.partition_point(|&(t, _, _)| t <= tick);
        let (seg_tick, seg_sec, uspq) = self.segments[pos.saturating_sub(1)];
        seg_sec + (tick - seg_tick) as f64 * uspq as f64 / (self.ppq * 1e6)
    }
}

/// Write a transcription to a MIDI file, creating parent directories
pub fn write_midi<P: AsRef<Path>>(midi: &Transcription, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = to_midi_bytes(midi)?;
    std::fs::write(path, bytes)?;
    debug!(path = %path.display(), notes = midi.total_notes(), "wrote MIDI");
    Ok(())
}

/// Serialize a transcription as a format-1 MIDI file at 120 BPM
pub fn to_midi_bytes(midi: &Transcription) -> Result<Vec<u8>> {
    let ticks_per_second = EXPORT_PPQ as f64 * 1e6 / EXPORT_TEMPO_USPQ as f64;
    let to_tick = |sec: f64| -> u32 { (sec.max(0.0) * ticks_per_second).round() as u32 };

    let mut tracks: Vec<Vec<TrackEvent>> = Vec::with_capacity(midi.instruments.len() + 1);

    // Tempo track
    tracks.push(vec![
        TrackEvent {
            delta: u28::from(0),
            kind: TrackEventKind::Meta(MetaMessage::Tempo(u24::from(EXPORT_TEMPO_USPQ))),
        },
        TrackEvent {
            delta: u28::from(0),
            kind: TrackEventKind::Meta(MetaMessage::TimeSignature(4, 2, 24, 8)),
        },
        TrackEvent {
            delta: u28::from(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        },
    ]);

    let mut melodic_index = 0usize;
    for inst in &midi.instruments {
        let channel = if inst.is_drum {
            DRUM_CHANNEL
        } else {
            let ch = melodic_channel(melodic_index);
            melodic_index += 1;
            ch
        };

        let mut events = vec![TrackEvent {
            delta: u28::from(0),
            kind: TrackEventKind::Meta(MetaMessage::TrackName(inst.name.as_bytes())),
        }];
        if !inst.is_drum {
            events.push(TrackEvent {
                delta: u28::from(0),
                kind: TrackEventKind::Midi {
                    channel: u4::from(channel),
                    message: MidiMessage::ProgramChange {
                        program: u7::from(inst.program.min(127)),
                    },
                },
            });
        }

        // (tick, is_on, pitch, velocity); note-offs sort before note-ons on the same tick
        let mut timed: Vec<(u32, bool, u8, u8)> = Vec::with_capacity(inst.notes.len() * 2);
        for note in &inst.notes {
            if !note.is_well_formed() {
                return Err(EnhanceError::MidiExport(format!(
                    "malformed note in '{}': pitch {} {:.3}-{:.3}s",
                    inst.name, note.pitch, note.onset, note.offset
                )));
            }
            let on = to_tick(note.onset);
            let off = to_tick(note.offset).max(on + 1);
            timed.push((on, true, note.pitch, note.velocity.clamp(1, 127)));
            timed.push((off, false, note.pitch, 0));
        }
        timed.sort_by_key(|&(tick, is_on, pitch, _)| (tick, is_on, pitch));

        let mut current_tick = 0u32;
        for (tick, is_on, pitch, velocity) in timed {
            let message = if is_on {
                MidiMessage::NoteOn {
                    key: u7::from(pitch.min(127)),
                    vel: u7::from(velocity),
                }
            } else {
                MidiMessage::NoteOff {
                    key: u7::from(pitch.min(127)),
                    vel: u7::from(0),
                }
            };
            events.push(TrackEvent {
                delta: u28::from(tick - current_tick),
                kind: TrackEventKind::Midi {
                    channel: u4::from(channel),
                    message,
                },
            });
            current_tick = tick;
        }

        events.push(TrackEvent {
            delta: u28::from(0),
            kind: TrackEventKind::Meta(MetaMessage::EndOfTrack),
        });
        tracks.push(events);
    }

    let smf = Smf {
        header: Header {
            format: Format::Parallel,
            timing: Timing::Metrical(u15::from(EXPORT_PPQ)),
        },
        tracks,
    };

    let mut bytes = Vec::new();
    smf.write(&mut bytes)
        .map_err(|e| EnhanceError::MidiExport(format!("Failed to write MIDI data: {:?}", e)))?;
    Ok(bytes)
}

/// Channels 0-15 except the drum channel, cycling
fn melodic_channel(index: usize) -> u8 {
    let ch = (index % 15) as u8;
    if ch >= DRUM_CHANNEL {
        ch + 1
    } else {
        ch
    }
}
