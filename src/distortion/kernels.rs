//! Predistortion kernels for flux pulses.
//!
//! Every kernel is built the same way: model the step response of the
//! distorting element, take its impulse response (first difference), and
//! invert it causally. Convolving a waveform with the result undoes the
//! distortion on the first `length` samples.

use crate::error::{AppResult, McError};

const FRAC_2_SQRT_PI: f64 = std::f64::consts::FRAC_2_SQRT_PI;

/// Unit step, `1` for `t >= 0`.
pub fn heaviside(t: f64) -> f64 {
    if t >= 0.0 {
        1.0
    } else {
        0.0
    }
}

/// `1` on `[0, width)`, `0` elsewhere.
pub fn square(t: f64, width: f64) -> f64 {
    heaviside(t) - heaviside(t - width)
}

/// Complementary error function, accurate to ~1e-13.
pub fn erfc(x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    if x < 0.0 {
        return 2.0 - erfc(-x);
    }
    if x < 2.5 {
        // Maclaurin series of erf.
        let x2 = x * x;
        let mut term = x;
        let mut sum = x;
        let mut n = 0.0;
        loop {
            n += 1.0;
            term *= -x2 / n;
            let contribution = term / (2.0 * n + 1.0);
            sum += contribution;
            if contribution.abs() <= 1e-17 * sum.abs() {
                break;
            }
        }
        return 1.0 - FRAC_2_SQRT_PI * sum;
    }
    // Continued fraction, modified Lentz.
    let tiny = 1e-300;
    let mut f = x;
    let mut c = x;
    let mut d = 0.0;
    for k in 1..500 {
        let a = k as f64 / 2.0;
        d = x + a * d;
        d = if d.abs() < tiny { 1.0 / tiny } else { 1.0 / d };
        c = x + a / c;
        if c.abs() < tiny {
            c = tiny;
        }
        let delta = c * d;
        f *= delta;
        if (delta - 1.0).abs() < 1e-16 {
            break;
        }
    }
    (-x * x).exp() / std::f64::consts::PI.sqrt() / f
}

/// `[1, 0, 0, ...]`
pub fn identity_kernel(length: usize) -> Vec<f64> {
    let mut kernel = vec![0.0; length];
    if let Some(first) = kernel.first_mut() {
        *first = 1.0;
    }
    kernel
}

/// Inverse of the impulse response belonging to `step`.
pub fn kernel_from_step_response(step: &[f64]) -> AppResult<Vec<f64>> {
    if step.is_empty() {
        return Err(McError::Kernel("step response is empty".to_string()));
    }
    let impulse: Vec<f64> = step
        .iter()
        .enumerate()
        .map(|(i, s)| if i == 0 { *s } else { s - step[i - 1] })
        .collect();

    let h0 = impulse[0];
    if !h0.is_finite() || h0.abs() < 1e-12 {
        return Err(McError::Kernel(format!(
            "first sample of the impulse response is {}, cannot invert",
            h0
        )));
    }

    let mut kernel = vec![0.0; impulse.len()];
    kernel[0] = 1.0 / h0;
    for n in 1..impulse.len() {
        let acc: f64 = (1..=n).map(|j| impulse[j] * kernel[n - j]).sum();
        kernel[n] = -acc / h0;
    }
    Ok(kernel)
}

fn check_length(length: usize) -> AppResult<()> {
    if length == 0 {
        return Err(McError::Kernel("kernel length must be at least 1".to_string()));
    }
    Ok(())
}

/// Skin-effect correction, step response `erfc(alpha / (21·√(t+1)))`.
pub fn skin_kernel(alpha: f64, length: usize) -> AppResult<Vec<f64>> {
    check_length(length)?;
    if alpha == 0.0 {
        return Ok(identity_kernel(length));
    }
    let step: Vec<f64> = (0..length)
        .map(|t| erfc(alpha / (21.0 * (t as f64 + 1.0).sqrt())))
        .collect();
    kernel_from_step_response(&step)
}

/// Single reflection of relative amplitude `amp` arriving after `time` samples.
pub fn bounce_kernel(amp: f64, time: f64, length: usize) -> AppResult<Vec<f64>> {
    check_length(length)?;
    let step: Vec<f64> = (0..length)
        .map(|t| {
            let t = t as f64;
            (heaviside(t) + amp * heaviside(t - time)) / (1.0 + amp)
        })
        .collect();
    kernel_from_step_response(&step)
}

/// Exponential overshoot `amp·exp(-t/tau)` on top of the step.
pub fn decay_kernel(amp: f64, tau: f64, length: usize) -> AppResult<Vec<f64>> {
    check_length(length)?;
    if tau <= 0.0 {
        return Err(McError::Kernel(format!("decay tau must be positive, got {}", tau)));
    }
    let step: Vec<f64> = (0..length)
        .map(|t| 1.0 + amp * (-(t as f64) / tau).exp())
        .collect();
    kernel_from_step_response(&step)
}

/// Full discrete convolution.
pub fn convolve(a: &[f64], b: &[f64]) -> Vec<f64> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let mut out = vec![0.0; a.len() + b.len() - 1];
    for (i, x) in a.iter().enumerate() {
        for (j, y) in b.iter().enumerate() {
            out[i + j] += x * y;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_almost_equal(actual: &[f64], expected: &[f64], decimal: i32) {
        assert_eq!(actual.len(), expected.len());
        let tol = 1.5 * 10f64.powi(-decimal);
        for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
            assert!((a - e).abs() < tol, "index {}: {} != {}", i, a, e);
        }
    }

    #[test]
    fn test_heaviside() {
        let hs: Vec<f64> = [-1.0, -0.5, 0.0, 1.0, 2.0].iter().map(|t| heaviside(*t)).collect();
        assert_eq!(hs, vec![0.0, 0.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_square() {
        let sq: Vec<f64> = (-2..5).map(|t| square(t as f64, 3.0)).collect();
        assert_eq!(sq, vec![0.0, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_erfc_values() {
        assert!((erfc(0.0) - 1.0).abs() < 1e-15);
        assert!((erfc(0.5) - 0.479_500_122_186_953_5).abs() < 1e-13);
        assert!((erfc(1.0) - 0.157_299_207_050_285_13).abs() < 1e-13);
        assert!((erfc(3.0) - 2.209_049_699_858_544e-5).abs() < 1e-16);
        assert!((erfc(-1.0) - 1.842_700_792_949_715).abs() < 1e-13);
    }

    #[test]
    fn test_skin_kernel_known_values() {
        let known = [
            1.00540222e+00, -1.59080709e-03, -7.02241770e-04, -4.17894781e-04,
            -2.84886822e-04, -2.10146281e-04, -1.63242389e-04, -1.31535177e-04,
            -1.08919606e-04, -9.21203433e-05, -7.92379832e-05, -6.91027435e-05,
            -6.09587865e-05, -5.42982090e-05, -4.87683793e-05, -4.41176036e-05,
            -4.01619210e-05, -3.67640800e-05, -3.38198160e-05, -3.12486520e-05,
            -2.89875850e-05, -2.69866621e-05, -2.52058216e-05, -2.36126000e-05,
            -2.21804419e-05, -2.08874370e-05, -1.97153637e-05, -1.86489578e-05,
            -1.76753461e-05, -1.67836041e-05, -1.59644070e-05, -1.52097526e-05,
            -1.45127390e-05, -1.38673850e-05, -1.32684847e-05, -1.27114874e-05,
            -1.21924004e-05, -1.17077070e-05, -1.12542990e-05, -1.08294205e-05,
        ];
        let kernel = skin_kernel(0.1, 40).unwrap();
        assert_almost_equal(&kernel, &known, 7);
    }

    #[test]
    fn test_skin_kernel_zero_alpha_is_identity() {
        assert_eq!(skin_kernel(0.0, 4).unwrap(), vec![1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_kernel_inverts_step() {
        let step: Vec<f64> = (0..50).map(|t| 1.0 + 0.3 * (-(t as f64) / 7.0).exp()).collect();
        let impulse: Vec<f64> = step
            .iter()
            .enumerate()
            .map(|(i, s)| if i == 0 { *s } else { s - step[i - 1] })
            .collect();
        let kernel = kernel_from_step_response(&step).unwrap();
        let restored = convolve(&impulse, &kernel);
        assert!((restored[0] - 1.0).abs() < 1e-12);
        assert!(restored[1..50].iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn test_disabled_kernels_are_identity() {
        assert_eq!(decay_kernel(0.0, 1.0, 1).unwrap(), vec![1.0]);
        assert_eq!(bounce_kernel(0.0, 1.0, 1).unwrap(), vec![1.0]);
    }

    #[test]
    fn test_bounce_kernel_first_sample() {
        let k = bounce_kernel(0.2, 12.0, 40).unwrap();
        assert!((k[0] - 1.2).abs() < 1e-12);
        assert!(k[1..12].iter().all(|v| v.abs() < 1e-12));
        assert!((k[12] + 0.24).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_kernels() {
        assert!(kernel_from_step_response(&[]).is_err());
        assert!(kernel_from_step_response(&[0.0, 1.0]).is_err());
        assert!(decay_kernel(-1.0, 5.0, 10).is_err());
        assert!(decay_kernel(0.5, 0.0, 10).is_err());
        assert!(skin_kernel(0.1, 0).is_err());
    }

    #[test]
    fn test_convolve() {
        assert_eq!(convolve(&[1.0, 2.0], &[1.0, 1.0, 1.0]), vec![1.0, 3.0, 3.0, 2.0]);
        assert!(convolve(&[], &[1.0]).is_empty());
    }
}
