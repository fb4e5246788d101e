//! Metrics recorder: append-only per-track logs and batch summaries
//!
//! Three files live under the metrics directory:
//! - `pipeline_metrics.jsonl`: one full record per line, including `_detailed`
//! - `pipeline_metrics.csv`: the flat columns only, header fixed at creation
//! - `batch_summary.json`: rewritten whenever a summary is computed

use crate::error::RecorderError;
use crate::passes::pass_1::FeatureStats;
use crate::passes::pass_2::{ConsolidationStats, MergeEvent};
use crate::passes::pass_3::RefinementReport;
use crate::report::{EnhancementReport, StageOutcome};
use chrono::Local;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub type RecorderResult<T> = std::result::Result<T, RecorderError>;

pub const JSONL_FILE: &str = "pipeline_metrics.jsonl";
pub const CSV_FILE: &str = "pipeline_metrics.csv";
pub const SUMMARY_FILE: &str = "batch_summary.json";

/// Tabular columns, in file order
pub const CSV_COLUMNS: [&str; 29] = [
    "track_id",
    "track_name",
    "timestamp",
    "audio_duration_s",
    "instruments_original",
    "notes_original",
    "feature_extraction_time_s",
    "prony_success_rate_avg",
    "prony_success_rate_min",
    "prony_success_rate_max",
    "features_extracted",
    "consolidation_time_s",
    "consolidation_strategy",
    "instruments_after_consolidation",
    "instrument_pairs_merged",
    "instrument_reduction_count",
    "instrument_reduction_percent",
    "decay_threshold",
    "spectral_threshold",
    "fallback_mode",
    "refinement_time_s",
    "refinement_status",
    "program_assignments",
    "instruments_final",
    "notes_final",
    "notes_reduction_count",
    "notes_reduction_percent",
    "total_time_s",
    "pipeline_status",
];

/// Flat per-track metrics; field order matches `CSV_COLUMNS`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatMetrics {
    pub track_id: String,
    pub track_name: String,
    pub timestamp: String,
    pub audio_duration_s: f64,
    pub instruments_original: usize,
    pub notes_original: usize,
    pub feature_extraction_time_s: f64,
    pub prony_success_rate_avg: f64,
    pub prony_success_rate_min: f64,
    pub prony_success_rate_max: f64,
    pub features_extracted: usize,
    pub consolidation_time_s: f64,
    pub consolidation_strategy: String,
    pub instruments_after_consolidation: usize,
    pub instrument_pairs_merged: usize,
    pub instrument_reduction_count: i64,
    pub instrument_reduction_percent: f64,
    pub decay_threshold: f64,
    pub spectral_threshold: f64,
    pub fallback_mode: bool,
    pub refinement_time_s: f64,
    pub refinement_status: String,
    pub program_assignments: usize,
    pub instruments_final: usize,
    pub notes_final: usize,
    pub notes_reduction_count: i64,
    pub notes_reduction_percent: f64,
    pub total_time_s: f64,
    pub pipeline_status: String,
}

/// Hierarchical detail kept only in the line-delimited log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetailedMetrics {
    pub feature_stats: Option<FeatureStats>,
    pub consolidation_stats: Option<ConsolidationStats>,
    pub refinement_stage: Option<StageOutcome<RefinementReport>>,
    pub merge_history: Vec<MergeEvent>,
}

/// One line of the line-delimited log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    #[serde(flatten)]
    pub flat: FlatMetrics,
    #[serde(rename = "_detailed")]
    pub detailed: DetailedMetrics,
}

fn round_to(value: f64, places: i32) -> f64 {
    let scale = 10f64.powi(places);
    (value * scale).round() / scale
}

impl MetricsRecord {
    /// Flatten an enhancement report into a record
    pub fn from_report(
        track_id: &str,
        track_name: &str,
        report: &EnhancementReport,
        audio_duration: f64,
    ) -> Self {
        let feature_stats = report.feature_stats().cloned();
        let consolidation = report.consolidation_stats();
        let timing = &report.timing;

        let (prony_avg, prony_min, prony_max, instruments_processed) = feature_stats
            .as_ref()
            .map(|s| {
                (
                    s.success_rate_avg(),
                    s.success_rate_min(),
                    s.success_rate_max(),
                    s.instruments_processed,
                )
            })
            .unwrap_or((0.0, 0.0, 0.0, 0));

        let notes_original = report.input_stats.total_notes;
        let notes_final = report.output_stats.total_notes;
        let notes_reduction_count = notes_original as i64 - notes_final as i64;

        let refinement_stage = report.stages.refinement.clone();
        let flat = FlatMetrics {
            track_id: track_id.to_string(),
            track_name: track_name.to_string(),
            timestamp: Local::now().to_rfc3339(),
            audio_duration_s: round_to(audio_duration, 2),
            instruments_original: report.input_stats.total_instruments,
            notes_original,
            feature_extraction_time_s: round_to(timing.feature_extraction, 2),
            prony_success_rate_avg: round_to(prony_avg, 4),
            prony_success_rate_min: round_to(prony_min, 4),
            prony_success_rate_max: round_to(prony_max, 4),
            features_extracted: instruments_processed,
            consolidation_time_s: round_to(timing.consolidation, 2),
            consolidation_strategy: consolidation
                .map_or("unknown", |s| s.strategy.as_str())
                .to_string(),
            instruments_after_consolidation: consolidation.map_or(0, |s| s.output_instruments),
            instrument_pairs_merged: consolidation.map_or(0, |s| s.merges_performed),
            instrument_reduction_count: consolidation.map_or(0, |s| {
                s.input_instruments as i64 - s.output_instruments as i64
            }),
            instrument_reduction_percent: consolidation
                .map_or(0.0, |s| round_to(s.reduction_rate * 100.0, 2)),
            decay_threshold: consolidation.map_or(0.0, |s| s.decay_threshold),
            spectral_threshold: consolidation.map_or(0.0, |s| s.spectral_threshold),
            fallback_mode: consolidation.is_some_and(|s| s.fallback_mode),
            refinement_time_s: round_to(timing.refinement, 2),
            refinement_status: refinement_stage
                .as_ref()
                .map_or("unknown", StageOutcome::status)
                .to_string(),
            program_assignments: refinement_stage
                .as_ref()
                .and_then(StageOutcome::value)
                .map_or(0, |r| r.program_assignments.len()),
            instruments_final: report.output_stats.total_instruments,
            notes_final,
            notes_reduction_count,
            notes_reduction_percent: round_to(
                100.0 * notes_reduction_count as f64 / notes_original.max(1) as f64,
                2,
            ),
            total_time_s: round_to(timing.total_seconds, 2),
            pipeline_status: report.pipeline_status.as_str().to_string(),
        };

        let merge_history = consolidation
            .map(|s| s.merge_history.clone())
            .unwrap_or_default();

        Self {
            flat,
            detailed: DetailedMetrics {
                feature_stats,
                consolidation_stats: consolidation.cloned(),
                refinement_stage,
                merge_history,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.flat.pipeline_status == "success"
    }
}

/// Aggregates across every recorded track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BatchSummary {
    NoData {
        total_tracks: usize,
    },
    AllFailed {
        total_tracks: usize,
        successful: usize,
        failed: usize,
    },
    Complete(BatchStatistics),
}

/// Averages are over successful tracks only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchStatistics {
    pub timestamp: String,
    pub total_tracks: usize,
    pub successful: usize,
    pub failed: usize,
    /// Percent
    pub success_rate: f64,
    pub avg_instruments_original: f64,
    pub avg_instruments_final: f64,
    pub avg_instrument_reduction_percent: f64,
    pub avg_instrument_pairs_merged: f64,
    pub avg_prony_success_rate: f64,
    pub avg_total_time_s: f64,
    pub avg_feature_extraction_time_s: f64,
    pub avg_consolidation_time_s: f64,
    pub avg_refinement_time_s: f64,
    pub tracks_with_fallback: usize,
    /// Percent of successful tracks
    pub fallback_rate: f64,
}

/// Summarise a set of records
pub fn summarize(records: &[MetricsRecord]) -> BatchSummary {
    let total_tracks = records.len();
    if total_tracks == 0 {
        return BatchSummary::NoData { total_tracks: 0 };
    }

    let succeeded: Vec<&FlatMetrics> = records
        .iter()
        .filter(|r| r.is_success())
        .map(|r| &r.flat)
        .collect();
    let successful = succeeded.len();
    let failed = total_tracks - successful;
    if successful == 0 {
        return BatchSummary::AllFailed {
            total_tracks,
            successful: 0,
            failed,
        };
    }

    let avg = |f: fn(&FlatMetrics) -> f64| -> f64 {
        succeeded.iter().map(|m| f(m)).sum::<f64>() / successful as f64
    };
    let tracks_with_fallback = succeeded.iter().filter(|m| m.fallback_mode).count();

    BatchSummary::Complete(BatchStatistics {
        timestamp: Local::now().to_rfc3339(),
        total_tracks,
        successful,
        failed,
        success_rate: round_to(successful as f64 / total_tracks as f64 * 100.0, 2),
        avg_instruments_original: round_to(avg(|m| m.instruments_original as f64), 1),
        avg_instruments_final: round_to(avg(|m| m.instruments_final as f64), 1),
        avg_instrument_reduction_percent: round_to(avg(|m| m.instrument_reduction_percent), 2),
        avg_instrument_pairs_merged: round_to(avg(|m| m.instrument_pairs_merged as f64), 2),
        avg_prony_success_rate: round_to(avg(|m| m.prony_success_rate_avg), 4),
        avg_total_time_s: round_to(avg(|m| m.total_time_s), 2),
        avg_feature_extraction_time_s: round_to(avg(|m| m.feature_extraction_time_s), 2),
        avg_consolidation_time_s: round_to(avg(|m| m.consolidation_time_s), 2),
        avg_refinement_time_s: round_to(avg(|m| m.refinement_time_s), 2),
        tracks_with_fallback,
        fallback_rate: round_to(tracks_with_fallback as f64 / successful as f64 * 100.0, 2),
    })
}

/// Append-only recorder bound to one metrics directory
#[derive(Debug)]
pub struct MetricsRecorder {
    dir: PathBuf,
    json_path: PathBuf,
    csv_path: PathBuf,
    summary_path: PathBuf,
    write_lock: Mutex<()>,
}

impl MetricsRecorder {
    /// Open (creating if needed) a metrics directory.
    ///
    /// Fails with `HeaderMismatch` if an existing CSV log has different columns.
    pub fn new<P: AsRef<Path>>(dir: P) -> RecorderResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let recorder = Self {
            json_path: dir.join(JSONL_FILE),
            csv_path: dir.join(CSV_FILE),
            summary_path: dir.join(SUMMARY_FILE),
            dir,
            write_lock: Mutex::new(()),
        };
        recorder.ensure_csv_header()?;
        debug!(dir = %recorder.dir.display(), "metrics recorder ready");
        Ok(recorder)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn json_path(&self) -> &Path {
        &self.json_path
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    pub fn summary_path(&self) -> &Path {
        &self.summary_path
    }

    fn ensure_csv_header(&self) -> RecorderResult<()> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(CSV_COLUMNS)?;
        let header = writer.into_inner().map_err(|e| e.into_error())?;

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.csv_path)
        {
            Ok(mut file) => {
                file.write_all(&header)?;
                file.flush()?;
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        // Existing but empty, e.g. touched by hand
        let mut file = open_append(&self.csv_path)?;
        if file.metadata()?.len() == 0 {
            file.write_all(&header)?;
            file.flush()?;
            return Ok(());
        }

        let mut reader = csv::Reader::from_path(&self.csv_path)?;
        let found: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        if found.iter().map(String::as_str).ne(CSV_COLUMNS.iter().copied()) {
            return Err(RecorderError::HeaderMismatch {
                expected: CSV_COLUMNS.join(","),
                found: found.join(","),
            });
        }
        Ok(())
    }

    /// Flatten a report and append it to both logs
    pub fn record_track(
        &self,
        track_id: &str,
        track_name: &str,
        report: &EnhancementReport,
        audio_duration: f64,
    ) -> RecorderResult<MetricsRecord> {
        let record = MetricsRecord::from_report(track_id, track_name, report, audio_duration);
        self.append(&record)?;
        info!(track_id, status = %record.flat.pipeline_status, "recorded track metrics");
        Ok(record)
    }

    /// Append one record to both logs, or to neither.
    ///
    /// Both files are opened before anything is written. The CSV row goes
    /// first and is truncated away again if the JSONL write fails.
    pub fn append(&self, record: &MetricsRecord) -> RecorderResult<()> {
        let mut json_line = serde_json::to_vec(record)?;
        json_line.push(b'\n');

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.serialize(&record.flat)?;
        let csv_row = writer.into_inner().map_err(|e| e.into_error())?;

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut csv_file = open_append(&self.csv_path)?;
        let mut json_file = open_append(&self.json_path)?;
        let csv_len = csv_file.metadata()?.len();

        csv_file.write_all(&csv_row)?;
        csv_file.flush()?;
        if let Err(e) = json_file.write_all(&json_line).and_then(|()| json_file.flush()) {
            if let Err(rollback) = csv_file.set_len(csv_len) {
                warn!(error = %rollback, "could not roll back CSV row");
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Every record in the line-delimited log, in append order
    pub fn load_all_metrics(&self) -> RecorderResult<Vec<MetricsRecord>> {
        let file = match File::open(&self.json_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            records.push(serde_json::from_str(line)?);
        }
        Ok(records)
    }

    /// Summarise every recorded track and rewrite the summary file
    pub fn compute_batch_summary(&self) -> RecorderResult<BatchSummary> {
        let records = self.load_all_metrics()?;
        let summary = summarize(&records);
        std::fs::write(&self.summary_path, serde_json::to_string_pretty(&summary)?)?;
        if let BatchSummary::AllFailed { failed, .. } = &summary {
            warn!(failed, "no successful tracks recorded");
        }
        Ok(summary)
    }

    /// Compute the batch summary and print it to the console
    pub fn print_summary(&self) -> RecorderResult<BatchSummary> {
        let summary = self.compute_batch_summary()?;
        println!("{}", render_summary(&summary));
        Ok(summary)
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Console rendering of a batch summary
pub fn render_summary(summary: &BatchSummary) -> String {
    let rule = "=".repeat(70);
    let mut lines = vec![
        rule.clone(),
        "BATCH PROCESSING SUMMARY".to_string(),
        rule.clone(),
    ];

    match summary {
        BatchSummary::NoData { .. } => lines.push("No metrics recorded yet.".to_string()),
        BatchSummary::AllFailed {
            total_tracks,
            failed,
            ..
        } => {
            lines.push(format!("Total tracks: {}", total_tracks));
            lines.push(format!("All {} tracks failed or degraded.", failed));
        }
        BatchSummary::Complete(s) => {
            lines.push("Overall:".to_string());
            lines.push(format!("  - Total tracks: {}", s.total_tracks));
            lines.push(format!("  - Successful: {} ({:.1}%)", s.successful, s.success_rate));
            lines.push(format!("  - Failed: {}", s.failed));
            lines.push("Instrument reduction:".to_string());
            lines.push(format!("  - Average original: {:.1}", s.avg_instruments_original));
            lines.push(format!("  - Average final: {:.1}", s.avg_instruments_final));
            lines.push(format!(
                "  - Average reduction: {:.1}%",
                s.avg_instrument_reduction_percent
            ));
            lines.push(format!(
                "  - Average pairs merged: {:.2}",
                s.avg_instrument_pairs_merged
            ));
            lines.push("Feature extraction:".to_string());
            lines.push(format!(
                "  - Average Prony success rate: {:.1}%",
                s.avg_prony_success_rate * 100.0
            ));
            lines.push("Timing (average per track):".to_string());
            lines.push(format!("  - Total: {:.2}s", s.avg_total_time_s));
            lines.push(format!(
                "  - Feature extraction: {:.2}s",
                s.avg_feature_extraction_time_s
            ));
            lines.push(format!("  - Consolidation: {:.2}s", s.avg_consolidation_time_s));
            lines.push(format!("  - Refinement: {:.2}s", s.avg_refinement_time_s));
            lines.push("Fallback mode:".to_string());
            lines.push(format!(
                "  - Tracks using fallback: {} ({:.1}%)",
                s.tracks_with_fallback, s.fallback_rate
            ));
        }
    }
    lines.push(rule);
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_columns_match_struct_fields() {
        let mut writer = csv::Writer::from_writer(Vec::new());
        let flat = FlatMetrics {
            track_id: "t".into(),
            track_name: "t".into(),
            timestamp: "now".into(),
            audio_duration_s: 0.0,
            instruments_original: 0,
            notes_original: 0,
            feature_extraction_time_s: 0.0,
            prony_success_rate_avg: 0.0,
            prony_success_rate_min: 0.0,
            prony_success_rate_max: 0.0,
            features_extracted: 0,
            consolidation_time_s: 0.0,
            consolidation_strategy: "unknown".into(),
            instruments_after_consolidation: 0,
            instrument_pairs_merged: 0,
            instrument_reduction_count: 0,
            instrument_reduction_percent: 0.0,
            decay_threshold: 0.0,
            spectral_threshold: 0.0,
            fallback_mode: false,
            refinement_time_s: 0.0,
            refinement_status: "unknown".into(),
            program_assignments: 0,
            instruments_final: 0,
            notes_final: 0,
            notes_reduction_count: 0,
            notes_reduction_percent: 0.0,
            total_time_s: 0.0,
            pipeline_status: "success".into(),
        };
        writer.serialize(&flat).unwrap();
        let text = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(header, CSV_COLUMNS.join(","));
    }

    #[test]
    fn test_round_to() {
        assert_eq!(round_to(1.23456, 2), 1.23);
        assert_eq!(round_to(0.99999, 4), 1.0);
    }

    #[test]
    fn test_summarize_empty() {
        assert_eq!(summarize(&[]), BatchSummary::NoData { total_tracks: 0 });
        let value = serde_json::to_value(summarize(&[])).unwrap();
        assert_eq!(value, serde_json::json!({"status": "no_data", "total_tracks": 0}));
    }
}
