//! Tests for the append-only metrics recorder and batch summaries

use midi_enhance::config::EnhancementConfig;
use midi_enhance::recorder::{BatchSummary, MetricsRecorder, CSV_COLUMNS, CSV_FILE};
use midi_enhance::{
    EnhancementReport, Enhancer, InstrumentTrack, Note, RecorderError, Transcription,
};
use ndarray::Array1;
use std::f32::consts::PI;
use std::sync::Arc;
use tempfile::TempDir;

const SR: u32 = 16000;

fn transcription(notes: usize) -> Transcription {
    let notes = (0..notes)
        .map(|i| {
            let onset = i as f64 * 0.1;
            Note::new(69 + (i % 7) as u8, onset, onset + 0.08, 100)
        })
        .collect();
    Transcription::new(vec![InstrumentTrack::with_notes(0, false, notes)])
}

fn plucked(midi: &Transcription) -> Vec<f32> {
    let mut audio = vec![0.0f32; ((midi.end_time() + 0.5) * SR as f64) as usize];
    for (_, _, note) in midi.notes_with_track() {
        let start = (note.onset * SR as f64).round() as usize;
        let freq = 440.0 * 2f32.powf((note.pitch as f32 - 69.0) / 12.0);
        for n in 0..(SR as usize / 10) {
            if let Some(sample) = audio.get_mut(start + n) {
                let t = n as f32 / SR as f32;
                *sample += 0.5 * (-12.0 * t).exp() * (2.0 * PI * freq * t).sin();
            }
        }
    }
    audio
}

fn successful_report() -> EnhancementReport {
    let midi = transcription(30);
    let audio = Array1::from(plucked(&midi)).into_dyn();
    let (_, report) = Enhancer::new(EnhancementConfig::default())
        .unwrap()
        .enhance_transcription(&midi, &audio, SR, false)
        .unwrap();
    assert!(!report.is_degraded());
    report
}

fn degraded_report() -> EnhancementReport {
    let midi = transcription(30);
    let silence = Array1::<f32>::zeros(SR as usize * 4).into_dyn();
    let (_, report) = Enhancer::new(EnhancementConfig::default())
        .unwrap()
        .enhance_transcription(&midi, &silence, SR, false)
        .unwrap();
    assert!(report.is_degraded());
    report
}

fn read_summary_status(recorder: &MetricsRecorder) -> String {
    let text = std::fs::read_to_string(recorder.summary_path()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    value["status"].as_str().unwrap().to_string()
}

#[test]
fn test_jsonl_and_csv_stay_consistent() {
    let dir = TempDir::new().unwrap();
    let recorder = MetricsRecorder::new(dir.path()).unwrap();

    let (good, bad) = (successful_report(), degraded_report());
    recorder.record_track("001", "intro", &good, 3.5).unwrap();
    recorder.record_track("002", "verse", &bad, 4.0).unwrap();

    let records = recorder.load_all_metrics().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].flat.track_id, "001");
    assert_eq!(records[0].flat.pipeline_status, "success");
    assert_eq!(records[1].flat.pipeline_status, "degraded");
    assert!(records[0].detailed.feature_stats.is_some());
    assert!(records[1].detailed.consolidation_stats.is_none());

    let mut reader = csv::Reader::from_path(recorder.csv_path()).unwrap();
    let headers = reader.headers().unwrap().clone();
    assert_eq!(headers.iter().collect::<Vec<_>>(), CSV_COLUMNS.to_vec());
    let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 2);
    assert_eq!(&rows[0][0], "001");
    assert_eq!(&rows[1][0], "002");
    assert_eq!(&rows[1][CSV_COLUMNS.len() - 1], "degraded");
    assert_eq!(&rows[0][3], "3.5");
}

#[test]
fn test_record_fields_from_successful_run() {
    let dir = TempDir::new().unwrap();
    let recorder = MetricsRecorder::new(dir.path()).unwrap();
    let report = successful_report();

    let record = recorder
        .record_track("007", "007_bridge", &report, 3.456)
        .unwrap();
    let flat = &record.flat;
    assert_eq!(flat.audio_duration_s, 3.46);
    assert_eq!(flat.notes_original, 30);
    assert_eq!(flat.instruments_original, 1);
    assert_eq!(flat.consolidation_strategy, "conservative");
    assert_eq!(flat.refinement_status, "success");
    assert_eq!(flat.program_assignments, 1);
    assert_eq!(
        flat.notes_reduction_count,
        flat.notes_original as i64 - flat.notes_final as i64
    );
    assert!(flat.prony_success_rate_avg > 0.5);
}

#[test]
fn test_reopening_keeps_existing_log() {
    let dir = TempDir::new().unwrap();
    let report = degraded_report();
    {
        let recorder = MetricsRecorder::new(dir.path()).unwrap();
        recorder.record_track("001", "001", &report, 1.0).unwrap();
    }
    let recorder = MetricsRecorder::new(dir.path()).unwrap();
    recorder.record_track("002", "002", &report, 1.0).unwrap();

    assert_eq!(recorder.load_all_metrics().unwrap().len(), 2);
    let csv = std::fs::read_to_string(recorder.csv_path()).unwrap();
    assert_eq!(csv.lines().count(), 3);
}

#[test]
fn test_header_mismatch_is_rejected() {
    let dir = TempDir::new().unwrap();
    let csv_path = dir.path().join("pipeline_metrics.csv");
    std::fs::write(&csv_path, "track_id,notes\n1,2\n").unwrap();

    match MetricsRecorder::new(dir.path()) {
        Err(RecorderError::HeaderMismatch { found, .. }) => assert_eq!(found, "track_id,notes"),
        other => panic!("expected header mismatch, got {:?}", other),
    }
}

#[test]
fn test_summary_with_no_data() {
    let dir = TempDir::new().unwrap();
    let recorder = MetricsRecorder::new(dir.path()).unwrap();

    let summary = recorder.compute_batch_summary().unwrap();
    assert_eq!(summary, BatchSummary::NoData { total_tracks: 0 });
    assert_eq!(read_summary_status(&recorder), "no_data");
}

#[test]
fn test_summary_with_all_failed() {
    let dir = TempDir::new().unwrap();
    let recorder = MetricsRecorder::new(dir.path()).unwrap();
    let report = degraded_report();
    recorder.record_track("001", "001", &report, 4.0).unwrap();
    recorder.record_track("002", "002", &report, 4.0).unwrap();

    let summary = recorder.compute_batch_summary().unwrap();
    assert_eq!(
        summary,
        BatchSummary::AllFailed {
            total_tracks: 2,
            successful: 0,
            failed: 2
        }
    );
    assert_eq!(read_summary_status(&recorder), "all_failed");
}

#[test]
fn test_summary_averages_successful_tracks() {
    let dir = TempDir::new().unwrap();
    let recorder = MetricsRecorder::new(dir.path()).unwrap();
    let (good, bad) = (successful_report(), degraded_report());
    recorder.record_track("001", "001", &good, 3.5).unwrap();
    recorder.record_track("002", "002", &good, 3.5).unwrap();
    recorder.record_track("003", "003", &bad, 4.0).unwrap();

    let BatchSummary::Complete(stats) = recorder.compute_batch_summary().unwrap() else {
        panic!("expected a complete summary");
    };
    assert_eq!(stats.total_tracks, 3);
    assert_eq!(stats.successful, 2);
    assert_eq!(stats.failed, 1);
    assert!((stats.success_rate - 66.67).abs() < 1e-9);
    assert_eq!(stats.avg_instruments_original, 1.0);
    assert_eq!(read_summary_status(&recorder), "complete");
}

#[test]
fn test_concurrent_appends_do_not_interleave() {
    let dir = TempDir::new().unwrap();
    let recorder = Arc::new(MetricsRecorder::new(dir.path()).unwrap());
    let report = degraded_report();

    std::thread::scope(|scope| {
        for worker in 0..8 {
            let recorder = Arc::clone(&recorder);
            let report = &report;
            scope.spawn(move || {
                for i in 0..5 {
                    let id = format!("{}-{}", worker, i);
                    recorder.record_track(&id, &id, report, 4.0).unwrap();
                }
            });
        }
    });

    assert_eq!(recorder.load_all_metrics().unwrap().len(), 40);
    let mut reader = csv::Reader::from_path(recorder.csv_path()).unwrap();
    assert_eq!(reader.records().filter(|r| r.is_ok()).count(), 40);
}

#[test]
fn test_failed_append_leaves_both_logs_unchanged() {
    let dir = TempDir::new().unwrap();
    let recorder = MetricsRecorder::new(dir.path()).unwrap();
    let report = degraded_report();
    recorder.record_track("001", "001", &report, 4.0).unwrap();

    let saved_csv = dir.path().join("saved.csv");
    let saved_jsonl = dir.path().join("saved.jsonl");

    // CSV log replaced by a directory: nothing may reach the JSONL log
    std::fs::rename(recorder.csv_path(), &saved_csv).unwrap();
    std::fs::create_dir(recorder.csv_path()).unwrap();
    assert!(recorder.record_track("002", "002", &report, 4.0).is_err());
    assert_eq!(recorder.load_all_metrics().unwrap().len(), 1);

    // And the other way round
    std::fs::remove_dir(recorder.csv_path()).unwrap();
    std::fs::rename(&saved_csv, recorder.csv_path()).unwrap();
    std::fs::rename(recorder.json_path(), &saved_jsonl).unwrap();
    std::fs::create_dir(recorder.json_path()).unwrap();
    assert!(recorder.record_track("003", "003", &report, 4.0).is_err());
    let csv = std::fs::read_to_string(recorder.csv_path()).unwrap();
    assert_eq!(csv.lines().count(), 2);
}

#[test]
fn test_empty_csv_gets_header_and_rows_survive_reopen() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join(CSV_FILE), "").unwrap();

    let first = MetricsRecorder::new(dir.path()).unwrap();
    let mut reader = csv::Reader::from_path(first.csv_path()).unwrap();
    let headers = reader.headers().unwrap().clone();
    assert_eq!(headers.iter().collect::<Vec<_>>(), CSV_COLUMNS.to_vec());

    let report = degraded_report();
    first.record_track("001", "001", &report, 4.0).unwrap();
    let second = MetricsRecorder::new(dir.path()).unwrap();
    let csv = std::fs::read_to_string(second.csv_path()).unwrap();
    assert_eq!(csv.lines().count(), 2);
}
