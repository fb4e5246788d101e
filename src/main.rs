use clap::{Parser, Subcommand};
use midi_enhance::config::{load_config, EnhancementConfig};
use midi_enhance::recorder::{MetricsRecorder, JSONL_FILE};
use midi_enhance::report::{export_report_json, render_report};
use midi_enhance::Enhancer;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// MIDI Transcription Enhancement
#[derive(Parser)]
#[command(name = "midi-enhance")]
#[command(about = "Consolidate and refine automatic MIDI transcriptions using the source audio")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enhance a transcription against its source audio
    Enhance {
        /// Input MIDI transcription
        #[arg(long)]
        midi: PathBuf,

        /// Source audio (WAV)
        #[arg(long)]
        audio: PathBuf,

        /// Output MIDI path (default: <midi stem>_enhanced.mid)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Custom configuration file (YAML or JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Reference MIDI for precision/recall evaluation
        #[arg(long)]
        ground_truth: Option<PathBuf>,

        /// Write the full report as JSON
        #[arg(long)]
        report_json: Option<PathBuf>,

        /// Append per-track metrics to this directory
        #[arg(long)]
        metrics_dir: Option<PathBuf>,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },
    /// Print the batch summary of a metrics directory
    Summary {
        #[arg(long, default_value = "./metrics")]
        metrics_dir: PathBuf,
    },
    /// Validate configuration file
    ValidateConfig {
        /// Configuration file to validate
        config: PathBuf,
    },
    /// Show default configuration
    ShowConfig,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Enhance {
            midi,
            audio,
            output,
            config,
            ground_truth,
            report_json,
            metrics_dir,
            verbose,
        } => {
            init_logging(verbose);

            let config = match config {
                Some(path) => load_config(path)?,
                None => EnhancementConfig::default(),
            };

            let mut enhancer = Enhancer::new(config)?;
            if let Some(dir) = metrics_dir {
                enhancer = enhancer.with_recorder(Arc::new(MetricsRecorder::new(dir)?));
            }

            let mut run = enhancer.enhance_from_file(&midi, &audio, output.as_deref())?;

            if let Some(reference) = ground_truth {
                let reference = midi_enhance::midi::read_midi(reference)?;
                let comparison = enhancer.compare_enhancement(
                    &run.original,
                    &run.enhanced,
                    &run.audio.clone().into_dyn(),
                    run.sample_rate,
                    Some(&reference),
                )?;
                run.report.evaluation = Some(comparison);
            }

            println!("{}", render_report(&run.report));
            if let Some(path) = report_json {
                export_report_json(&run.report, &path)?;
                println!("Report saved to {}", path.display());
            }
            println!("Enhanced MIDI saved to {}", run.output_path.display());
            if let Some(recorder) = enhancer.recorder() {
                recorder.print_summary()?;
            }
        }
        Commands::Summary { metrics_dir } => {
            init_logging(false);
            if !metrics_dir.join(JSONL_FILE).exists() {
                eprintln!("No metrics log found in {}", metrics_dir.display());
                std::process::exit(1);
            }
            MetricsRecorder::new(&metrics_dir)?.print_summary()?;
        }
        Commands::ValidateConfig { config } => {
            let config = load_config(config)?;
            println!("Configuration is valid");
            if let Ok(yaml) = serde_yaml::to_string(&config) {
                println!("{}", yaml);
            }
        }
        Commands::ShowConfig => {
            let config = EnhancementConfig::default();
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
    }

    Ok(())
}
