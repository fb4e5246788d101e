//! End-to-end tests for the enhancement pipeline

use midi_enhance::config::EnhancementConfig;
use midi_enhance::passes::{ConsolidationStats, Consolidator, FeatureExtractor, FeatureSet};
use midi_enhance::{
    EnhanceError, Enhancer, FeatureError, InstrumentTrack, Note, PipelineStatus, StageOutcome,
    Transcription,
};
use ndarray::{Array1, Array2, Array3};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::PI;
use std::sync::Arc;

const SR: u32 = 16000;
const NOTE_SPACING: f64 = 0.1;

fn pitch_hz(pitch: u8) -> f32 {
    440.0 * 2f32.powf((pitch as f32 - 69.0) / 12.0)
}

/// Two instruments taking turns, one note every 100 ms
fn alternating_transcription(total_notes: usize) -> Transcription {
    let mut piano = InstrumentTrack::new(0, false);
    let mut organ = InstrumentTrack::new(16, false);
    for i in 0..total_notes {
        let onset = i as f64 * NOTE_SPACING;
        let offset = onset + 0.08;
        if i % 2 == 0 {
            piano.notes.push(Note::new(72 + (i % 12) as u8, onset, offset, 96));
        } else {
            organ.notes.push(Note::new(64 + (i % 5) as u8, onset, offset, 80));
        }
    }
    Transcription::new(vec![piano, organ])
}

/// Render each note as an exponentially decaying sine that rings until the next onset
fn render_audio(midi: &Transcription, decay_per_track: &[f32]) -> Vec<f32> {
    let total = ((midi.end_time() + 0.5) * SR as f64) as usize;
    let ring = (NOTE_SPACING * SR as f64) as usize;
    let mut audio = vec![0.0f32; total];

    for (t, track) in midi.instruments.iter().enumerate() {
        let k = decay_per_track[t];
        for note in &track.notes {
            let start = (note.onset * SR as f64).round() as usize;
            let freq = pitch_hz(note.pitch);
            for n in 0..ring {
                let Some(sample) = audio.get_mut(start + n) else {
                    break;
                };
                let time = n as f32 / SR as f32;
                *sample += 0.5 * (-k * time).exp() * (2.0 * PI * freq * time).sin();
            }
        }
    }
    audio
}

fn fixture(total_notes: usize) -> (Transcription, ndarray::ArrayD<f32>) {
    let midi = alternating_transcription(total_notes);
    let audio = Array1::from(render_audio(&midi, &[15.0, 20.0])).into_dyn();
    (midi, audio)
}

/// One timbre split over two tracks; each pitch is played twice in a row,
/// once per track, leaving a 20 ms gap between the fragments
fn split_sustain_transcription(total_notes: usize) -> Transcription {
    let mut left = InstrumentTrack::new(0, false);
    let mut right = InstrumentTrack::new(1, false);
    for i in 0..total_notes {
        let onset = i as f64 * NOTE_SPACING;
        let note = Note::new(60 + ((i / 2) % 4) as u8, onset, onset + 0.08, 90);
        if i % 2 == 0 {
            left.notes.push(note);
        } else {
            right.notes.push(note);
        }
    }
    Transcription::new(vec![left, right])
}

fn enhancer() -> Enhancer {
    Enhancer::new(EnhancementConfig::default()).unwrap()
}

#[test]
fn test_end_to_end_two_instruments() {
    let (midi, audio) = fixture(1000);
    assert_eq!(midi.total_notes(), 1000);

    let (enhanced, report) = enhancer()
        .enhance_transcription(&midi, &audio, SR, false)
        .unwrap();

    assert_eq!(report.pipeline_status, PipelineStatus::Success);
    assert!(matches!(report.stages.feature_extraction, Some(StageOutcome::Success(_))));
    assert!(matches!(report.stages.consolidation, Some(StageOutcome::Success(_))));
    assert!(matches!(report.stages.refinement, Some(StageOutcome::Success(_))));
    assert!(matches!(report.stages.metrics, Some(StageOutcome::Success(_))));

    assert!(enhanced.instrument_count() <= 2);
    assert!(enhanced.total_notes() <= 1000);
    assert!(report.timing.total_seconds > 0.0);
    assert_eq!(report.input_stats.total_notes, 1000);
    assert_eq!(report.output_stats.total_notes, enhanced.total_notes());

    let features = report.feature_stats().unwrap();
    assert_eq!(features.notes_processed, 1000);
    assert!(features.overall_success_rate > 0.5);

    let metrics = report.metrics().unwrap();
    assert_eq!(metrics.notes_original, 1000);
    assert_eq!(metrics.instruments_original, 2);
    assert!(report.refinements_applied().is_some());
}

#[test]
fn test_enhancement_is_deterministic() {
    let (midi, audio) = fixture(200);
    let enhancer = enhancer();

    let (first, first_report) = enhancer
        .enhance_transcription(&midi, &audio, SR, true)
        .unwrap();
    let (second, second_report) = enhancer
        .enhance_transcription(&midi, &audio, SR, true)
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(first_report.stages, second_report.stages);
    assert_eq!(first_report.intermediates, second_report.intermediates);
}

#[test]
fn test_serial_and_parallel_extraction_agree() {
    let (midi, audio) = fixture(120);
    let mut serial = EnhancementConfig::default();
    serial.features.parallel = false;

    let (parallel_out, parallel_report) = enhancer()
        .enhance_transcription(&midi, &audio, SR, false)
        .unwrap();
    let (serial_out, serial_report) = Enhancer::new(serial)
        .unwrap()
        .enhance_transcription(&midi, &audio, SR, false)
        .unwrap();

    assert_eq!(parallel_out, serial_out);
    assert_eq!(
        parallel_report.stages.feature_extraction,
        serial_report.stages.feature_extraction
    );
}

#[test]
fn test_notes_are_never_invented() {
    let (midi, audio) = fixture(200);
    let (enhanced, _) = enhancer()
        .enhance_transcription(&midi, &audio, SR, false)
        .unwrap();

    assert!(enhanced.total_notes() <= midi.total_notes());
    let original_pitches: std::collections::BTreeSet<u8> = midi
        .notes_with_track()
        .map(|(_, _, n)| n.pitch)
        .collect();
    for (_, _, note) in enhanced.notes_with_track() {
        assert!(note.is_well_formed(), "malformed note {:?}", note);
        assert!(original_pitches.contains(&note.pitch));
    }
}

#[test]
fn test_low_noise_floor_keeps_fits() {
    let midi = alternating_transcription(200);
    let mut samples = render_audio(&midi, &[15.0, 20.0]);
    let mut rng = StdRng::seed_from_u64(7);
    for x in samples.iter_mut() {
        *x += rng.gen_range(-1e-3..1e-3);
    }

    let (_, report) = enhancer()
        .enhance_transcription(&midi, &Array1::from(samples).into_dyn(), SR, false)
        .unwrap();

    assert_eq!(report.pipeline_status, PipelineStatus::Success);
    let features = report.feature_stats().unwrap();
    assert!(
        features.overall_success_rate >= 0.9,
        "success rate {}",
        features.overall_success_rate
    );
    let fallback = report.consolidation_stats().unwrap().fallback_mode;
    assert!(!fallback);
}

#[test]
fn test_stereo_input_matches_mono() {
    let midi = alternating_transcription(60);
    let mono = render_audio(&midi, &[15.0, 20.0]);
    let mut stereo = Array2::<f32>::zeros((2, mono.len()));
    for (i, &x) in mono.iter().enumerate() {
        stereo[[0, i]] = x;
        stereo[[1, i]] = x;
    }

    let enhancer = enhancer();
    let (from_mono, _) = enhancer
        .enhance_transcription(&midi, &Array1::from(mono).into_dyn(), SR, false)
        .unwrap();
    let (from_stereo, _) = enhancer
        .enhance_transcription(&midi, &stereo.into_dyn(), SR, false)
        .unwrap();
    assert_eq!(from_mono, from_stereo);
}

#[test]
fn test_silent_audio_degrades_to_original() {
    let midi = alternating_transcription(100);
    let samples = ((midi.end_time() + 0.5) * SR as f64) as usize;
    let silence = Array1::<f32>::zeros(samples).into_dyn();

    let (out, report) = enhancer()
        .enhance_transcription(&midi, &silence, SR, true)
        .unwrap();

    assert_eq!(out, midi);
    assert_eq!(report.pipeline_status, PipelineStatus::Degraded);
    assert!(report.is_degraded());
    let error = report
        .stages
        .feature_extraction
        .as_ref()
        .and_then(StageOutcome::error)
        .unwrap();
    assert!(error.contains("100 of 100"), "{}", error);
    assert!(report.stages.consolidation.is_none());
    assert!(report.stages.refinement.is_none());
    assert!(report.stages.metrics.is_none());
    assert_eq!(report.output_stats.total_notes, 100);
}

struct FailingConsolidator;

impl Consolidator for FailingConsolidator {
    fn consolidate(
        &self,
        _midi: &Transcription,
        _features: &FeatureSet,
        _config: &EnhancementConfig,
    ) -> midi_enhance::Result<(Transcription, ConsolidationStats)> {
        Err(EnhanceError::Consolidation("forced failure".to_string()))
    }
}

#[test]
fn test_consolidation_failure_falls_back() {
    let (midi, audio) = fixture(100);
    let enhancer = enhancer().with_consolidator(Arc::new(FailingConsolidator));

    let (enhanced, report) = enhancer
        .enhance_transcription(&midi, &audio, SR, true)
        .unwrap();

    let consolidation = report.stages.consolidation.as_ref().unwrap();
    assert_eq!(consolidation.status(), "failed");
    assert!(consolidation.error().unwrap().contains("forced failure"));
    assert_eq!(
        report.intermediates.as_ref().unwrap().post_consolidation.as_ref(),
        Some(&midi)
    );
    assert!(matches!(report.stages.refinement, Some(StageOutcome::Success(_))));
    assert_eq!(report.pipeline_status, PipelineStatus::Success);
    assert_eq!(enhanced.total_notes(), midi.total_notes());
    assert_eq!(enhanced.instrument_count(), midi.instrument_count());
}

struct BrokenExtractor;

impl FeatureExtractor for BrokenExtractor {
    fn extract(
        &self,
        _midi: &Transcription,
        _audio: &[f32],
        _sample_rate: u32,
        _config: &EnhancementConfig,
    ) -> Result<FeatureSet, FeatureError> {
        Err(FeatureError::Extraction("analysis backend unavailable".to_string()))
    }
}

#[test]
fn test_non_systemic_extraction_failure_is_fatal() {
    let (midi, audio) = fixture(20);
    let enhancer = enhancer().with_extractor(Arc::new(BrokenExtractor));

    let result = enhancer.enhance_transcription(&midi, &audio, SR, false);
    assert!(matches!(
        result,
        Err(EnhanceError::FeatureExtraction(FeatureError::Extraction(_)))
    ));
}

#[test]
fn test_invalid_inputs_rejected() {
    let (midi, audio) = fixture(20);
    let enhancer = enhancer();

    let cube = Array3::<f32>::zeros((2, 2, 100)).into_dyn();
    let empty = Transcription::default();
    assert!(matches!(
        enhancer.enhance_transcription(&midi, &cube, SR, false),
        Err(EnhanceError::InputValidation(_))
    ));
    assert!(matches!(
        enhancer.enhance_transcription(&empty, &audio, SR, false),
        Err(EnhanceError::InputValidation(_))
    ));
    assert!(matches!(
        enhancer.enhance_transcription(&midi, &audio, 0, false),
        Err(EnhanceError::InputValidation(_))
    ));
}

#[test]
fn test_intermediates_only_when_requested() {
    let (midi, audio) = fixture(40);
    let enhancer = enhancer();

    let (_, without) = enhancer
        .enhance_transcription(&midi, &audio, SR, false)
        .unwrap();
    assert!(without.intermediates.is_none());

    let (_, with) = enhancer
        .enhance_transcription(&midi, &audio, SR, true)
        .unwrap();
    let intermediates = with.intermediates.unwrap();
    assert_eq!(intermediates.note_features.len(), 40);
    assert_eq!(intermediates.track_features.len(), 2);
    assert!(intermediates.post_consolidation.is_some());
}

#[test]
fn test_compare_against_ground_truth() {
    let (midi, audio) = fixture(100);
    let enhancer = enhancer();
    let (enhanced, _) = enhancer
        .enhance_transcription(&midi, &audio, SR, false)
        .unwrap();

    let comparison = enhancer
        .compare_enhancement(&midi, &enhanced, &audio, SR, Some(&midi))
        .unwrap();

    assert_eq!(comparison.notes_original, 100);
    assert_eq!(comparison.notes_enhanced, enhanced.total_notes());
    let ground_truth = comparison.ground_truth.unwrap();
    assert!((ground_truth.original.f1 - 1.0).abs() < 1e-9);
    assert!(ground_truth.enhanced.precision > 0.0);
    assert!(comparison.original_quality.audio_coverage > 0.0);
}

#[test]
fn test_compare_rejects_3d_audio() {
    let (midi, _) = fixture(20);
    let cube = Array3::<f32>::zeros((2, 2, 100)).into_dyn();
    let enhancer = enhancer();
    assert!(matches!(
        enhancer.compare_enhancement(&midi, &midi, &cube, SR, None),
        Err(EnhanceError::InputValidation(_))
    ));
}

#[test]
fn test_shared_timbre_tracks_consolidate() {
    let midi = split_sustain_transcription(120);
    let audio = Array1::from(render_audio(&midi, &[15.0, 15.0])).into_dyn();
    let mut serial = EnhancementConfig::default();
    serial.features.parallel = false;

    let (first, first_report) = enhancer()
        .enhance_transcription(&midi, &audio, SR, false)
        .unwrap();
    let (second, second_report) = enhancer()
        .enhance_transcription(&midi, &audio, SR, false)
        .unwrap();
    let (serial_out, serial_report) = Enhancer::new(serial)
        .unwrap()
        .enhance_transcription(&midi, &audio, SR, false)
        .unwrap();

    let Some(StageOutcome::Success(stats)) = &first_report.stages.consolidation else {
        panic!("consolidation did not succeed");
    };
    assert!(!stats.fallback_mode);
    assert_eq!(stats.merges_performed, 1);
    assert_eq!(stats.merge_history.len(), 1);
    assert_eq!(stats.merge_history[0].merged, (0, 1));
    assert!(stats.merge_history[0].decay_similarity >= 0.8);
    assert_eq!(stats.input_instruments, 2);
    assert_eq!(stats.output_instruments, 1);
    assert!(stats.fragment_merges > 0);
    assert!(stats.notes_after < stats.notes_before);

    assert_eq!(first.instrument_count(), 1);
    assert!(first.total_notes() < midi.total_notes());

    assert_eq!(first, second);
    assert_eq!(first, serial_out);
    let consolidation = &first_report.stages.consolidation;
    assert_eq!(consolidation, &second_report.stages.consolidation);
    assert_eq!(consolidation, &serial_report.stages.consolidation);
}
