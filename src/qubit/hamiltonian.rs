//! Transmon spectrum from the charge-basis Hamiltonian.
//!
//! `H = 4·E_C·n² − (E_J/2)·(|n⟩⟨n+1| + |n+1⟩⟨n|)` for `n ∈ [−N, N]` is a
//! symmetric tridiagonal matrix, so the lowest levels are found with
//! Sturm-sequence bisection instead of a full diagonalization.

use std::f64::consts::PI;

use crate::error::{AppResult, McError};

/// Charge states on either side of zero.
pub const CHARGE_CUTOFF: i32 = 20;

/// Number of eigenvalues of the tridiagonal matrix below `x`.
fn count_below(diag: &[f64], off_sq: f64, x: f64) -> usize {
    let mut count = 0;
    let mut q = 1.0;
    for (i, d) in diag.iter().enumerate() {
        q = if i == 0 { d - x } else { d - x - off_sq / q };
        if q == 0.0 {
            q = f64::MIN_POSITIVE;
        }
        if q < 0.0 {
            count += 1;
        }
    }
    count
}

/// Lowest `n` eigenvalues of a symmetric tridiagonal matrix with constant
/// off-diagonal `off`.
fn lowest_eigenvalues(diag: &[f64], off: f64, n: usize) -> Vec<f64> {
    let off_sq = off * off;
    let lo = diag.iter().copied().fold(f64::INFINITY, f64::min) - 2.0 * off.abs();
    let hi = diag.iter().copied().fold(f64::NEG_INFINITY, f64::max) + 2.0 * off.abs();

    (0..n.min(diag.len()))
        .map(|k| {
            let (mut a, mut b) = (lo, hi);
            for _ in 0..200 {
                let mid = 0.5 * (a + b);
                if count_below(diag, off_sq, mid) > k {
                    b = mid;
                } else {
                    a = mid;
                }
                if b - a <= 1e-14 * a.abs().max(b.abs()).max(1.0) {
                    break;
                }
            }
            0.5 * (a + b)
        })
        .collect()
}

/// `E_J` of a SQUID transmon with junction asymmetry `d` at reduced flux `Φ`.
pub fn effective_ej(ej: f64, asymmetry: f64, reduced_flux: f64) -> f64 {
    let c = (PI * reduced_flux).cos();
    let s = (PI * reduced_flux).sin();
    ej * (c * c + asymmetry * asymmetry * s * s).sqrt()
}

/// First `n_transitions` transition energies `E_i − E_0` (same unit as
/// `ec` and `ej`).
pub fn transmon_transitions(
    ec: f64,
    ej: f64,
    asymmetry: f64,
    reduced_flux: f64,
    n_transitions: usize,
) -> AppResult<Vec<f64>> {
    if !(ec > 0.0 && ec.is_finite()) {
        return Err(McError::InvalidValue {
            parameter: "E_c".to_string(),
            value: ec.to_string(),
            reason: "must be positive".to_string(),
        });
    }
    if !(ej >= 0.0 && ej.is_finite()) {
        return Err(McError::InvalidValue {
            parameter: "E_j".to_string(),
            value: ej.to_string(),
            reason: "must be non-negative".to_string(),
        });
    }
    if n_transitions == 0 || n_transitions > 2 * CHARGE_CUTOFF as usize {
        return Err(McError::InvalidValue {
            parameter: "no_transitions".to_string(),
            value: n_transitions.to_string(),
            reason: format!("must be between 1 and {}", 2 * CHARGE_CUTOFF),
        });
    }

    let ej = effective_ej(ej, asymmetry, reduced_flux);
    let diag: Vec<f64> = (-CHARGE_CUTOFF..=CHARGE_CUTOFF)
        .map(|n| 4.0 * ec * f64::from(n * n))
        .collect();
    let levels = lowest_eigenvalues(&diag, -ej / 2.0, n_transitions + 1);
    Ok(levels[1..].iter().map(|e| e - levels[0]).collect())
}

/// Qubit frequency versus reduced flux for an asymmetric transmon.
pub fn qubit_freq_flux(flux: f64, f_max: f64, e_c: f64, asymmetry: f64) -> f64 {
    let c = (PI * flux).cos();
    let d2 = asymmetry * asymmetry;
    (f_max + e_c) * (d2 + (1.0 - d2) * c * c).powf(0.25) - e_c
}

/// Qubit frequency versus DAC voltage, `Φ = coefficient·(V − sweet_spot)`.
pub fn qubit_freq_dac(
    dac_voltage: f64,
    f_max: f64,
    e_c: f64,
    dac_sweet_spot: f64,
    dac_flux_coefficient: f64,
    asymmetry: f64,
) -> f64 {
    qubit_freq_flux(
        dac_flux_coefficient * (dac_voltage - dac_sweet_spot),
        f_max,
        e_c,
        asymmetry,
    )
}
