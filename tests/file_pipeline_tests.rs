//! File-based runs: MIDI + WAV in, enhanced MIDI and metrics out

use hound::{SampleFormat, WavSpec, WavWriter};
use midi_enhance::config::EnhancementConfig;
use midi_enhance::midi::{read_midi, write_midi};
use midi_enhance::recorder::MetricsRecorder;
use midi_enhance::report::{export_report_json, render_report};
use midi_enhance::{EnhanceError, EnhancementReport, Enhancer, InstrumentTrack, Note, Transcription};
use std::f32::consts::PI;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn two_track_song() -> Transcription {
    let mut lead = InstrumentTrack::new(80, false);
    let mut keys = InstrumentTrack::new(0, false);
    for i in 0..60 {
        let onset = i as f64 * 0.1;
        if i % 2 == 0 {
            lead.notes.push(Note::new(76 + (i % 4) as u8, onset, onset + 0.08, 100));
        } else {
            keys.notes.push(Note::new(67 + (i % 3) as u8, onset, onset + 0.08, 90));
        }
    }
    Transcription::new(vec![lead, keys])
}

fn write_wav(path: &Path, midi: &Transcription, sample_rate: u32) {
    let total = ((midi.end_time() + 0.5) * sample_rate as f64) as usize;
    let ring = sample_rate as usize / 10;
    let mut audio = vec![0.0f32; total];
    for (_, _, note) in midi.notes_with_track() {
        let start = (note.onset * sample_rate as f64).round() as usize;
        let freq = 440.0 * 2f32.powf((note.pitch as f32 - 69.0) / 12.0);
        for n in 0..ring {
            if let Some(sample) = audio.get_mut(start + n) {
                let t = n as f32 / sample_rate as f32;
                *sample += 0.5 * (-14.0 * t).exp() * (2.0 * PI * freq * t).sin();
            }
        }
    }

    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).unwrap();
    for x in audio {
        writer.write_sample((x * i16::MAX as f32) as i16).unwrap();
    }
    writer.finalize().unwrap();
}

fn write_inputs(dir: &Path, stem: &str, sample_rate: u32) -> (PathBuf, PathBuf, Transcription) {
    let midi = two_track_song();
    let midi_path = dir.join(format!("{}.mid", stem));
    let wav_path = dir.join(format!("{}.wav", stem));
    write_midi(&midi, &midi_path).unwrap();
    write_wav(&wav_path, &midi, sample_rate);
    (midi_path, wav_path, midi)
}

#[test]
fn test_enhance_from_file_writes_default_output() {
    let dir = TempDir::new().unwrap();
    let (midi_path, wav_path, midi) = write_inputs(dir.path(), "song01_mix", 16000);

    let enhancer = Enhancer::new(EnhancementConfig::default()).unwrap();
    let run = enhancer
        .enhance_from_file(&midi_path, &wav_path, None)
        .unwrap();

    let expected = dir.path().join("song01_mix_enhanced.mid");
    assert_eq!(run.output_path, expected);
    assert_eq!(
        run.report.output_path.as_deref(),
        Some(expected.display().to_string().as_str())
    );
    assert_eq!(run.original.total_notes(), midi.total_notes());
    assert_eq!(run.sample_rate, 16000);

    let written = read_midi(&expected).unwrap();
    assert_eq!(written.total_notes(), run.enhanced.total_notes());
    assert_eq!(written.instrument_count(), run.enhanced.instrument_count());
}

#[test]
fn test_enhance_from_file_records_metrics() {
    let dir = TempDir::new().unwrap();
    let (midi_path, wav_path, _) = write_inputs(dir.path(), "song01_mix", 16000);
    let metrics_dir = dir.path().join("metrics");

    let recorder = Arc::new(MetricsRecorder::new(&metrics_dir).unwrap());
    let enhancer = Enhancer::new(EnhancementConfig::default())
        .unwrap()
        .with_recorder(Arc::clone(&recorder));
    let output = dir.path().join("out").join("result.mid");
    enhancer
        .enhance_from_file(&midi_path, &wav_path, Some(&output))
        .unwrap();

    assert!(output.exists());
    assert_eq!(enhancer.recorder().unwrap().json_path(), recorder.json_path());
    let records = recorder.load_all_metrics().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].flat.track_id, "song01");
    assert_eq!(records[0].flat.track_name, "song01_mix");
    assert_eq!(records[0].flat.notes_original, 60);
    assert_eq!(records[0].flat.instruments_original, 2);
}

#[test]
fn test_audio_is_resampled_to_configured_rate() {
    let dir = TempDir::new().unwrap();
    let (midi_path, wav_path, _) = write_inputs(dir.path(), "lofi", 22050);

    let enhancer = Enhancer::new(EnhancementConfig::default()).unwrap();
    let run = enhancer
        .enhance_from_file(&midi_path, &wav_path, None)
        .unwrap();

    assert_eq!(run.sample_rate, 16000);
    assert_eq!(run.report.input_stats.sample_rate, 16000);
    // 5.98 s of notes plus 0.5 s of tail
    let seconds = run.audio.len() as f64 / 16000.0;
    assert!((seconds - 6.48).abs() < 0.05, "resampled to {} s", seconds);
}

#[test]
fn test_missing_inputs_are_errors() {
    let dir = TempDir::new().unwrap();
    let (midi_path, _, _) = write_inputs(dir.path(), "song", 16000);
    let enhancer = Enhancer::new(EnhancementConfig::default()).unwrap();

    let missing = dir.path().join("nope.wav");
    assert!(matches!(
        enhancer.enhance_from_file(&midi_path, &missing, None),
        Err(EnhanceError::Io(_))
    ));
}

#[test]
fn test_unsupported_audio_format() {
    let dir = TempDir::new().unwrap();
    let (midi_path, _, _) = write_inputs(dir.path(), "song", 16000);
    let mp3 = dir.path().join("song.mp3");
    std::fs::write(&mp3, b"ID3").unwrap();

    let enhancer = Enhancer::new(EnhancementConfig::default()).unwrap();
    assert!(matches!(
        enhancer.enhance_from_file(&midi_path, &mp3, None),
        Err(EnhanceError::InvalidAudioFormat(_))
    ));
}

#[test]
fn test_report_export_and_rendering() {
    let dir = TempDir::new().unwrap();
    let (midi_path, wav_path, _) = write_inputs(dir.path(), "song", 16000);

    let enhancer = Enhancer::new(EnhancementConfig::default()).unwrap();
    let run = enhancer
        .enhance_from_file(&midi_path, &wav_path, None)
        .unwrap();

    let json_path = dir.path().join("reports").join("song.json");
    export_report_json(&run.report, &json_path).unwrap();
    let text = std::fs::read_to_string(&json_path).unwrap();
    let loaded: EnhancementReport = serde_json::from_str(&text).unwrap();
    assert_eq!(loaded.stages, run.report.stages);
    assert_eq!(loaded.output_stats, run.report.output_stats);

    let text = render_report(&run.report);
    assert!(text.contains("Status: success"));
    assert!(text.contains("consolidation"));
}
