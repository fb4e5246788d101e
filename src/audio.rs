//! Audio I/O, channel collapse, resampling and small statistics helpers

use crate::error::{EnhanceError, Result};
use hound::WavReader;
use ndarray::{Array1, ArrayD, Axis, Ix1};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::path::Path;
use tracing::{debug, warn};

/// Load an audio file as mono samples, resampled to `target_rate` when given
pub fn load_audio_file<P: AsRef<Path>>(
    path: P,
    target_rate: Option<u32>,
) -> Result<(Array1<f32>, u32)> {
    let path = path.as_ref();

    // Determine file type from extension
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_lowercase();

    let (channels, sr) = match extension.as_str() {
        "wav" | "wave" => load_wav_file(path)?,
        _ => {
            return Err(EnhanceError::InvalidAudioFormat(format!(
                "Unsupported audio format: {}",
                extension
            )))
        }
    };

    let mono = average_channels(&channels);
    match target_rate {
        Some(target) if target != sr => {
            let resampled = resample(&mono, sr, target)?;
            Ok((Array1::from(resampled), target))
        }
        _ => Ok((Array1::from(mono), sr)),
    }
}

/// Load WAV file as planar channels
fn load_wav_file(path: &Path) -> Result<(Vec<Vec<f32>>, u32)> {
    let mut reader = WavReader::open(path)
        .map_err(|e| EnhanceError::AudioFile(e.to_string()))?;
    let spec = reader.spec();

    if spec.channels == 0 || spec.channels > 2 {
        return Err(EnhanceError::InvalidAudioFormat(format!(
            "{} channels not supported (mono or stereo only)",
            spec.channels
        )));
    }

    if spec.bits_per_sample > 32 {
        return Err(EnhanceError::InvalidAudioFormat(format!(
            "Unsupported bit depth: {}",
            spec.bits_per_sample
        )));
    }

    let mut interleaved: Vec<f32> = Vec::with_capacity(reader.len() as usize);
    match spec.sample_format {
        hound::SampleFormat::Int => {
            let max_value = (1i64 << (spec.bits_per_sample - 1)) as f32;
            for sample in reader.samples::<i32>() {
                let sample = sample.map_err(|e| EnhanceError::AudioFile(e.to_string()))?;
                interleaved.push(sample as f32 / max_value);
            }
        }
        hound::SampleFormat::Float => {
            for sample in reader.samples::<f32>() {
                let sample = sample.map_err(|e| EnhanceError::AudioFile(e.to_string()))?;
                interleaved.push(sample);
            }
        }
    }

    if interleaved.is_empty() {
        return Err(EnhanceError::AudioFile(format!(
            "{} contains no samples",
            path.display()
        )));
    }

    let n_channels = spec.channels as usize;
    let mut channels = vec![Vec::with_capacity(interleaved.len() / n_channels); n_channels];
    for frame in interleaved.chunks_exact(n_channels) {
        for (ch, &sample) in frame.iter().enumerate() {
            channels[ch].push(sample);
        }
    }

    Ok((channels, spec.sample_rate))
}

fn average_channels(channels: &[Vec<f32>]) -> Vec<f32> {
    match channels {
        [] => Vec::new(),
        [mono] => mono.clone(),
        _ => {
            let n = channels.iter().map(Vec::len).min().unwrap_or(0);
            let scale = 1.0 / channels.len() as f32;
            (0..n)
                .map(|i| channels.iter().map(|c| c[i]).sum::<f32>() * scale)
                .collect()
        }
    }
}

/// Resample mono audio with rubato
pub fn resample(samples: &[f32], input_rate: u32, output_rate: u32) -> Result<Vec<f32>> {
    if input_rate == output_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    if input_rate == 0 || output_rate == 0 {
        return Err(EnhanceError::AudioFile("sample rate must be positive".to_string()));
    }

    debug!(input_rate, output_rate, frames = samples.len(), "resampling audio");

    let mut resampler = FastFixedIn::<f32>::new(
        output_rate as f64 / input_rate as f64,
        1.0,
        PolynomialDegree::Septic,
        samples.len(),
        1,
    )
    .map_err(|e| EnhanceError::AudioFile(format!("Failed to create resampler: {}", e)))?;

    let mut output = resampler
        .process(&[samples], None)
        .map_err(|e| EnhanceError::AudioFile(format!("Resampling failed: {}", e)))?;

    Ok(output.pop().unwrap_or_default())
}

/// Collapse a 1-D (mono) or 2-D (channels x samples) waveform to mono.
///
/// Any other dimensionality, or a 2-D waveform with no channels, is rejected.
pub fn to_mono(audio: &ArrayD<f32>) -> Result<Array1<f32>> {
    match audio.ndim() {
        1 => audio
            .view()
            .into_dimensionality::<Ix1>()
            .map(|view| view.to_owned())
            .map_err(|e| EnhanceError::InputValidation(e.to_string())),
        2 => {
            if audio.shape()[0] > audio.shape()[1] {
                warn!(
                    shape = ?audio.shape(),
                    "stereo audio looks samples-first; averaging over axis 0 anyway"
                );
            }
            audio
                .mean_axis(Axis(0))
                .ok_or_else(|| EnhanceError::InputValidation("Audio has no channels".into()))?
                .into_dimensionality::<Ix1>()
                .map_err(|e| EnhanceError::InputValidation(e.to_string()))
        }
        n => Err(EnhanceError::InputValidation(format!(
            "Audio must be 1D or 2D, got {}D",
            n
        ))),
    }
}

/// Number of samples per channel of a 1-D or 2-D (channels, samples) waveform
pub fn frames_per_channel(audio: &ArrayD<f32>) -> Result<usize> {
    match audio.ndim() {
        1 => Ok(audio.len()),
        2 if audio.shape()[0] == 0 => Err(EnhanceError::InputValidation(
            "Audio has no channels".into(),
        )),
        2 => Ok(audio.shape()[1]),
        n => Err(EnhanceError::InputValidation(format!(
            "Audio must be 1D or 2D, got {}D",
            n
        ))),
    }
}

/// Median of a dataset, `None` when empty
pub fn median(data: &[f64]) -> Option<f64> {
    if data.is_empty() {
        return None;
    }
    Some(percentile(data, 50.0))
}

/// Compute the p-th percentile of a dataset with linear interpolation
pub fn percentile(data: &[f64], p: f64) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut sorted = data.to_vec();
    sorted.sort_by(f64::total_cmp);

    let p = p.clamp(0.0, 100.0);
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        return sorted[lower];
    }

    let fraction = rank - lower as f64;
    sorted[lower] + fraction * (sorted[upper] - sorted[lower])
}

/// Arithmetic mean, 0.0 when empty
pub fn mean(data: &[f64]) -> f64 {
    if data.is_empty() {
        0.0
    } else {
        data.iter().sum::<f64>() / data.len() as f64
    }
}
