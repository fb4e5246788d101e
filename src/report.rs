//! Enhancement report: per-stage outcomes, timing, console rendering

use crate::config::EnhancementConfig;
use crate::error::Result;
use crate::passes::pass_1::{FeatureStats, NoteFeatures, NoteId, TrackFeatures};
use crate::passes::pass_2::ConsolidationStats;
use crate::passes::pass_3::RefinementReport;
use crate::passes::pass_4::{EnhancementComparison, EnhancementMetrics};
use crate::passes::FeatureSet;
use crate::transcription::Transcription;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;

pub const PIPELINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result of one stage as it appears in the report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome<T> {
    Success(T),
    Failed { error: String },
}

impl<T> StageOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, StageOutcome::Success(_))
    }

    pub fn status(&self) -> &'static str {
        match self {
            StageOutcome::Success(_) => "success",
            StageOutcome::Failed { .. } => "failed",
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            StageOutcome::Success(v) => Some(v),
            StageOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            StageOutcome::Success(_) => None,
            StageOutcome::Failed { error } => Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    Degraded,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Success => "success",
            PipelineStatus::Degraded => "degraded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputStats {
    pub total_notes: usize,
    pub total_instruments: usize,
    pub duration_seconds: f64,
    pub audio_duration_seconds: f64,
    pub sample_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputStats {
    pub total_notes: usize,
    pub total_instruments: usize,
    pub duration_seconds: f64,
}

impl OutputStats {
    pub fn of(midi: &Transcription) -> Self {
        Self {
            total_notes: midi.total_notes(),
            total_instruments: midi.instrument_count(),
            duration_seconds: midi.end_time(),
        }
    }
}

/// Stages that did not run are absent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageReports {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_extraction: Option<StageOutcome<FeatureStats>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consolidation: Option<StageOutcome<ConsolidationStats>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refinement: Option<StageOutcome<RefinementReport>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StageOutcome<EnhancementMetrics>>,
}

/// Stage durations in seconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timing {
    pub feature_extraction: f64,
    pub consolidation: f64,
    pub refinement: f64,
    pub metrics: f64,
    pub total_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteFeatureEntry {
    #[serde(flatten)]
    pub id: NoteId,
    #[serde(flatten)]
    pub features: NoteFeatures,
}

/// Intermediate products, attached only on request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Intermediates {
    pub track_features: Vec<TrackFeatures>,
    pub note_features: Vec<NoteFeatureEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_consolidation: Option<Transcription>,
}

impl Intermediates {
    pub fn from_features(features: &FeatureSet) -> Self {
        Self {
            track_features: features.tracks().to_vec(),
            note_features: features
                .iter()
                .map(|(id, f)| NoteFeatureEntry {
                    id: *id,
                    features: *f,
                })
                .collect(),
            post_consolidation: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnhancementReport {
    pub pipeline_version: String,
    pub config: EnhancementConfig,
    pub input_stats: InputStats,
    pub stages: StageReports,
    pub timing: Timing,
    pub output_stats: OutputStats,
    pub pipeline_status: PipelineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediates: Option<Intermediates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation: Option<EnhancementComparison>,
}

impl EnhancementReport {
    pub fn new(config: &EnhancementConfig, input_stats: InputStats) -> Self {
        let output_stats = OutputStats {
            total_notes: input_stats.total_notes,
            total_instruments: input_stats.total_instruments,
            duration_seconds: input_stats.duration_seconds,
        };
        Self {
            pipeline_version: PIPELINE_VERSION.to_string(),
            config: config.clone(),
            input_stats,
            stages: StageReports::default(),
            timing: Timing::default(),
            output_stats,
            pipeline_status: PipelineStatus::Success,
            output_path: None,
            intermediates: None,
            evaluation: None,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.pipeline_status == PipelineStatus::Degraded
    }

    /// Structured refinement count, when refinement succeeded
    pub fn refinements_applied(&self) -> Option<usize> {
        self.stages
            .refinement
            .as_ref()
            .and_then(StageOutcome::value)
            .map(|r| r.total_refinements)
    }

    pub fn metrics(&self) -> Option<&EnhancementMetrics> {
        self.stages.metrics.as_ref().and_then(StageOutcome::value)
    }

    pub fn feature_stats(&self) -> Option<&FeatureStats> {
        self.stages
            .feature_extraction
            .as_ref()
            .and_then(StageOutcome::value)
    }

    pub fn consolidation_stats(&self) -> Option<&ConsolidationStats> {
        self.stages
            .consolidation
            .as_ref()
            .and_then(StageOutcome::value)
    }
}

/// Write the report as pretty JSON
pub fn export_report_json<P: AsRef<Path>>(report: &EnhancementReport, path: P) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(report)?)?;
    Ok(())
}

fn stage_line<T>(out: &mut String, label: &str, stage: &Option<StageOutcome<T>>, seconds: f64) {
    let _ = match stage {
        Some(StageOutcome::Success(_)) => {
            writeln!(out, "  {:<20} success  ({:.2}s)", label, seconds)
        }
        Some(StageOutcome::Failed { error }) => writeln!(out, "  {:<20} FAILED   {}", label, error),
        None => writeln!(out, "  {:<20} skipped", label),
    };
}

/// Human-readable rendering of a report for the console
pub fn render_report(report: &EnhancementReport) -> String {
    let mut out = String::new();
    let rule = "=".repeat(60);

    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "ENHANCEMENT REPORT (v{})", report.pipeline_version);
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "Status: {}", report.pipeline_status.as_str());

    let input = &report.input_stats;
    let _ = writeln!(
        out,
        "Input:  {} notes, {} instruments, {:.1}s MIDI / {:.1}s audio @ {} Hz",
        input.total_notes,
        input.total_instruments,
        input.duration_seconds,
        input.audio_duration_seconds,
        input.sample_rate
    );
    let output = &report.output_stats;
    let _ = writeln!(
        out,
        "Output: {} notes, {} instruments, {:.1}s",
        output.total_notes, output.total_instruments, output.duration_seconds
    );

    let _ = writeln!(out, "\nStages:");
    let timing = &report.timing;
    let stages = &report.stages;
    stage_line(
        &mut out,
        "feature_extraction",
        &stages.feature_extraction,
        timing.feature_extraction,
    );
    stage_line(
        &mut out,
        "consolidation",
        &stages.consolidation,
        timing.consolidation,
    );
    stage_line(
        &mut out,
        "refinement",
        &stages.refinement,
        timing.refinement,
    );
    stage_line(&mut out, "metrics", &stages.metrics, timing.metrics);

    if let Some(stats) = report.feature_stats() {
        let _ = writeln!(
            out,
            "\nFeatures: {}/{} notes fitted ({:.1}%)",
            stats.notes_succeeded,
            stats.notes_processed,
            stats.overall_success_rate * 100.0
        );
    }
    if let Some(stats) = report.consolidation_stats() {
        let _ = writeln!(
            out,
            "Consolidation: {:?}{}, {} instrument merges, {} fragment merges",
            stats.strategy,
            if stats.fallback_mode {
                " (fallback)"
            } else {
                ""
            },
            stats.merges_performed,
            stats.fragment_merges
        );
    }
    if let Some(count) = report.refinements_applied() {
        let _ = writeln!(out, "Refinements applied: {}", count);
    }
    if let Some(m) = report.metrics() {
        let _ = writeln!(
            out,
            "Instruments: {} -> {} ({:.1}% reduction)",
            m.instruments_original, m.instruments_enhanced, m.reduction_percent
        );
        let _ = writeln!(
            out,
            "Notes: {} -> {} ({:.1}% reduction)",
            m.notes_original, m.notes_enhanced, m.notes_reduction_percent
        );
    }

    let evaluation = report.evaluation.as_ref();
    if let Some(gt) = evaluation.and_then(|e| e.ground_truth.as_ref()) {
        let _ = writeln!(out, "\nGround truth:");
        let _ = writeln!(
            out,
            "  precision {:.3} -> {:.3} ({:+.3})",
            gt.original.precision, gt.enhanced.precision, gt.precision_delta
        );
        let _ = writeln!(
            out,
            "  recall    {:.3} -> {:.3} ({:+.3})",
            gt.original.recall, gt.enhanced.recall, gt.recall_delta
        );
        let _ = writeln!(
            out,
            "  f1        {:.3} -> {:.3} ({:+.3})",
            gt.original.f1, gt.enhanced.f1, gt.f1_delta
        );
    }

    if let Some(path) = &report.output_path {
        let _ = writeln!(out, "\nOutput written to {}", path);
    }
    let _ = writeln!(out, "Total time: {:.2}s", timing.total_seconds);
    let _ = write!(out, "{}", rule);
    out
}
