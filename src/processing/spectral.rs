// Frequency-domain analysis: Hann-windowed periodogram and band powers.

use std::f64::consts::PI;

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

pub fn hann_window(n: usize) -> Vec<f64> {
    if n <= 1 {
        return vec![1.0; n];
    }
    (0..n)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / (n - 1) as f64).cos()))
        .collect()
}

/// One-sided power spectral density of `samples`, Hann-windowed.
///
/// Returns `n / 2 + 1` bins; bin `k` covers frequency `k * rate / n`.
pub fn power_spectrum(samples: &[f64], sample_rate: f64) -> Vec<f64> {
    let n = samples.len();
    if n < 2 {
        return vec![];
    }

    let window = hann_window(n);
    let window_power: f64 = window.iter().map(|w| w * w).sum();

    let mut buffer: Vec<Complex<f64>> = samples
        .iter()
        .zip(&window)
        .map(|(x, w)| Complex::new(x * w, 0.0))
        .collect();

    let mut planner = FftPlanner::new();
    planner.plan_fft_forward(n).process(&mut buffer);

    let scale = 1.0 / (sample_rate * window_power);
    let half = n / 2;
    (0..=half)
        .map(|k| {
            let power = buffer[k].norm_sqr() * scale;
            // Interior bins carry energy from both spectrum halves.
            if k == 0 || (n % 2 == 0 && k == half) {
                power
            } else {
                2.0 * power
            }
        })
        .collect()
}

/// Mean power in `[low_hz, high_hz)` from a spectrum produced by
/// `power_spectrum` over `n` input samples.
pub fn band_power(spectrum: &[f64], sample_rate: f64, n: usize, low_hz: f64, high_hz: f64) -> f64 {
    if spectrum.is_empty() || n == 0 {
        return 0.0;
    }
    let bin_hz = sample_rate / n as f64;
    let lo = (low_hz / bin_hz).ceil() as usize;
    let hi = ((high_hz / bin_hz).floor() as usize).min(spectrum.len().saturating_sub(1));
    if lo > hi {
        return 0.0;
    }
    let sum: f64 = spectrum[lo..=hi].iter().sum();
    sum / (hi - lo + 1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hann_window_edges_zero() {
        let w = hann_window(64);
        assert!(w[0].abs() < 1e-12);
        assert!(w[63].abs() < 1e-12);
        assert!((w[32] - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_tone_lands_in_its_band() {
        let rate = 256.0;
        let n = 256;
        let tone: Vec<f64> = (0..n)
            .map(|i| (2.0 * PI * 10.0 * i as f64 / rate).sin())
            .collect();
        let spectrum = power_spectrum(&tone, rate);

        let alpha = band_power(&spectrum, rate, n, 8.0, 13.0);
        let gamma = band_power(&spectrum, rate, n, 30.0, 44.0);
        assert!(alpha > 100.0 * gamma.max(1e-12));
    }

    #[test]
    fn test_band_power_outside_spectrum_is_zero() {
        let spectrum = vec![1.0; 129];
        assert_eq!(band_power(&spectrum, 256.0, 256, 500.0, 600.0), 0.0);
        assert_eq!(band_power(&[], 256.0, 256, 1.0, 4.0), 0.0);
    }
}
