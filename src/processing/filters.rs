// Time-domain filters applied to raw channels before feature extraction.

use std::f64::consts::PI;

/// First-order IIR high-pass. Seeded at zero so a DC baseline (PPG rides
/// on tens of thousands of ADC counts) does not enter as a step transient.
pub fn highpass(samples: &[f64], sample_rate: f64, cutoff_hz: f64) -> Vec<f64> {
    if samples.is_empty() || cutoff_hz <= 0.0 {
        return samples.to_vec();
    }
    let rc = 1.0 / (2.0 * PI * cutoff_hz);
    let dt = 1.0 / sample_rate;
    let alpha = rc / (rc + dt);

    let mut out = Vec::with_capacity(samples.len());
    out.push(0.0);
    for i in 1..samples.len() {
        let y = alpha * (out[i - 1] + samples[i] - samples[i - 1]);
        out.push(y);
    }
    out
}

/// First-order IIR low-pass.
pub fn lowpass(samples: &[f64], sample_rate: f64, cutoff_hz: f64) -> Vec<f64> {
    if samples.is_empty() || cutoff_hz <= 0.0 {
        return samples.to_vec();
    }
    let rc = 1.0 / (2.0 * PI * cutoff_hz);
    let dt = 1.0 / sample_rate;
    let alpha = dt / (rc + dt);

    let mut out = Vec::with_capacity(samples.len());
    out.push(samples[0]);
    for i in 1..samples.len() {
        let y = out[i - 1] + alpha * (samples[i] - out[i - 1]);
        out.push(y);
    }
    out
}

/// Band-pass as a high-pass / low-pass cascade.
pub fn bandpass(samples: &[f64], sample_rate: f64, low_hz: f64, high_hz: f64) -> Vec<f64> {
    lowpass(&highpass(samples, sample_rate, low_hz), sample_rate, high_hz)
}

/// Biquad notch for mains interference.
pub fn notch(samples: &[f64], sample_rate: f64, notch_hz: f64, q: f64) -> Vec<f64> {
    if samples.len() < 3 || notch_hz <= 0.0 || notch_hz >= sample_rate / 2.0 {
        return samples.to_vec();
    }
    let omega = 2.0 * PI * notch_hz / sample_rate;
    let alpha = omega.sin() / (2.0 * q);
    let cos_omega = omega.cos();

    let a0 = 1.0 + alpha;
    let b0 = 1.0 / a0;
    let b1 = -2.0 * cos_omega / a0;
    let b2 = 1.0 / a0;
    let a1 = -2.0 * cos_omega / a0;
    let a2 = (1.0 - alpha) / a0;

    let mut out = Vec::with_capacity(samples.len());
    let (mut x1, mut x2, mut y1, mut y2) = (0.0, 0.0, 0.0, 0.0);
    for &x in samples {
        let y = b0 * x + b1 * x1 + b2 * x2 - a1 * y1 - a2 * y2;
        x2 = x1;
        x1 = x;
        y2 = y1;
        y1 = y;
        out.push(y);
    }
    out
}
