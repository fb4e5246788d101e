//! Spectral processing utilities (STFT, centroid, envelopes)

use ndarray::{Array1, Array2, ArrayView1};
use rustfft::{num_complex::Complex32, Fft, FftPlanner};
use std::sync::Arc;

/// STFT data structure
#[derive(Debug, Clone)]
pub struct StftData {
    pub s: Array2<Complex32>,
    pub freqs: Vec<f32>,
}

/// FFT plan plus analysis window, built once per run and shared across notes
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    n_fft: usize,
    freqs: Vec<f32>,
}

impl SpectrumAnalyzer {
    pub fn new(n_fft: usize, sample_rate: u32) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n_fft);
        let freqs = (0..n_fft / 2 + 1)
            .map(|i| i as f32 * sample_rate as f32 / n_fft as f32)
            .collect();
        Self {
            fft,
            window: generate_window("hann", n_fft),
            n_fft,
            freqs,
        }
    }

    /// STFT with hop `hop_length`; input shorter than one frame is zero-padded
    pub fn stft(&self, y: &[f32], hop_length: usize) -> StftData {
        let n_fft = self.n_fft;
        let hop_length = hop_length.max(1);
        let n_frames = if y.len() <= n_fft {
            1
        } else {
            (y.len() - n_fft) / hop_length + 1
        };
        let mut s = Array2::<Complex32>::zeros((n_fft / 2 + 1, n_frames));
        let mut frame = vec![Complex32::new(0.0, 0.0); n_fft];

        for frame_idx in 0..n_frames {
            let start = frame_idx * hop_length;
            for (i, slot) in frame.iter_mut().enumerate() {
                let sample = y.get(start + i).copied().unwrap_or(0.0);
                *slot = Complex32::new(sample * self.window[i], 0.0);
            }

            self.fft.process(&mut frame);

            for (i, &val) in frame[..n_fft / 2 + 1].iter().enumerate() {
                s[[i, frame_idx]] = val;
            }
        }

        StftData {
            s,
            freqs: self.freqs.clone(),
        }
    }

    /// Centroid of a segment shorter than one frame: windowed over its own
    /// length, then zero-padded to `n_fft`
    fn short_centroid(&self, segment: &[f32]) -> f32 {
        let window = generate_window("hann", segment.len());
        let mut frame = vec![Complex32::new(0.0, 0.0); self.n_fft];
        for ((slot, &x), &w) in frame.iter_mut().zip(segment).zip(&window) {
            *slot = Complex32::new(x * w, 0.0);
        }
        self.fft.process(&mut frame);

        let bins = &frame[..self.n_fft / 2 + 1];
        let mag: Array1<f32> = bins.iter().map(|c| c.norm()).collect();
        spectral_centroid(&mag.view(), &self.freqs)
    }

    /// Energy-weighted mean spectral centroid of a segment, 0.0 when silent
    pub fn centroid(&self, segment: &[f32]) -> f32 {
        if segment.is_empty() {
            return 0.0;
        }
        if segment.len() < self.n_fft {
            return self.short_centroid(segment);
        }
        let stft_data = self.stft(segment, self.n_fft / 2);
        let mag = magnitude_spectrogram(&stft_data);

        let mut weighted = 0.0f64;
        let mut total_energy = 0.0f64;
        for frame in mag.columns() {
            let energy: f64 = frame.iter().map(|&m| (m as f64) * (m as f64)).sum();
            if energy <= 0.0 {
                continue;
            }
            weighted += spectral_centroid(&frame, &stft_data.freqs) as f64 * energy;
            total_energy += energy;
        }

        if total_energy > 0.0 {
            (weighted / total_energy) as f32
        } else {
            0.0
        }
    }
}

/// Generate window function
pub fn generate_window(window_type: &str, size: usize) -> Vec<f32> {
    match window_type {
        "hann" if size > 1 => (0..size)
            .map(|i| {
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32).cos())
            })
            .collect(),
        _ => vec![1.0; size], // Rectangular window as fallback
    }
}

/// Compute magnitude spectrogram
pub fn magnitude_spectrogram(stft_data: &StftData) -> Array2<f32> {
    stft_data.s.map(|c| c.norm())
}

/// Compute spectral centroid of one magnitude frame
pub fn spectral_centroid(mag_frame: &ArrayView1<f32>, freqs: &[f32]) -> f32 {
    let mut numerator = 0.0;
    let mut denominator = 0.0;

    for i in 0..mag_frame.len().min(freqs.len()) {
        let magnitude = mag_frame[i].abs();
        numerator += freqs[i] * magnitude;
        denominator += magnitude;
    }

    if denominator > 0.0 {
        numerator / denominator
    } else {
        0.0
    }
}

/// Frame-wise RMS envelope
pub fn rms_envelope(samples: &[f32], frame_length: usize, hop_length: usize) -> Vec<f32> {
    if samples.is_empty() || frame_length == 0 || hop_length == 0 {
        return Vec::new();
    }

    let mut envelope = Vec::with_capacity(samples.len() / hop_length + 1);
    let mut start = 0;
    while start < samples.len() {
        let end = (start + frame_length).min(samples.len());
        let frame = &samples[start..end];
        let energy: f32 = frame.iter().map(|&x| x * x).sum();
        envelope.push((energy / frame.len() as f32).sqrt());
        if end == samples.len() {
            break;
        }
        start += hop_length;
    }
    envelope
}
