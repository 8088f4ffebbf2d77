//! Precomputed DDPM noise schedule.
//!
//! For a linear beta ramp from `beta1` to `beta2` over `T` steps, every
//! array holds `T + 1` entries indexed by the timestep `t ∈ 0..=T`:
//!
//! ```text
//! β_t           = (β2 − β1)·t/T + β1
//! α_t           = 1 − β_t
//! ᾱ_t           = exp(Σ_{s≤t} ln α_s)
//! sqrtab        = √ᾱ_t
//! sqrtmab       = √(1 − ᾱ_t)
//! oneover_sqrta = 1/√α_t
//! mab_over_sqrtmab = (1 − α_t)/√(1 − ᾱ_t)
//! ```
//!
//! Arithmetic is done in f64 and stored as f32.

use ddpm_core::DdpmError;

/// Per-timestep schedule coefficients, each of length `n_t + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct NoiseSchedule {
    /// β_t.
    pub beta_t: Vec<f32>,
    /// √β_t, the posterior noise scale.
    pub sqrt_beta_t: Vec<f32>,
    /// α_t = 1 − β_t.
    pub alpha_t: Vec<f32>,
    /// 1/√α_t.
    pub oneover_sqrta: Vec<f32>,
    /// ᾱ_t, cumulative product of α.
    pub alphabar_t: Vec<f32>,
    /// √ᾱ_t, the signal coefficient of x_t.
    pub sqrtab: Vec<f32>,
    /// √(1 − ᾱ_t), the noise coefficient of x_t.
    pub sqrtmab: Vec<f32>,
    /// (1 − α_t)/√(1 − ᾱ_t), the ε coefficient in the reverse step.
    pub mab_over_sqrtmab: Vec<f32>,
}

impl NoiseSchedule {
    /// Number of diffusion steps T (arrays have `T + 1` entries).
    pub fn n_t(&self) -> usize {
        self.beta_t.len() - 1
    }
}

/// Builds the schedule for a linear beta ramp.
///
/// # Errors
///
/// Returns [`DdpmError::InvalidConfig`] unless `0 < beta1 < beta2 < 1` and
/// `n_t > 0`.
///
/// # Example
///
/// ```
/// use ddpm_model::ddpm_schedules;
///
/// let s = ddpm_schedules(1e-4, 0.02, 600).unwrap();
/// assert_eq!(s.beta_t.len(), 601);
/// assert!((s.beta_t[600] - 0.02).abs() < 1e-7);
/// assert!(ddpm_schedules(0.02, 1e-4, 600).is_err());
/// ```
pub fn ddpm_schedules(beta1: f64, beta2: f64, n_t: usize) -> Result<NoiseSchedule, DdpmError> {
    if !(0.0 < beta1 && beta1 < beta2 && beta2 < 1.0) {
        return Err(DdpmError::InvalidConfig {
            message: format!("beta1 and beta2 must satisfy 0 < beta1 < beta2 < 1, got ({beta1}, {beta2})"),
        });
    }
    if n_t == 0 {
        return Err(DdpmError::InvalidConfig {
            message: "ddpm_schedules: n_t must be > 0".to_string(),
        });
    }

    let len = n_t + 1;
    let mut s = NoiseSchedule {
        beta_t: Vec::with_capacity(len),
        sqrt_beta_t: Vec::with_capacity(len),
        alpha_t: Vec::with_capacity(len),
        oneover_sqrta: Vec::with_capacity(len),
        alphabar_t: Vec::with_capacity(len),
        sqrtab: Vec::with_capacity(len),
        sqrtmab: Vec::with_capacity(len),
        mab_over_sqrtmab: Vec::with_capacity(len),
    };

    let mut log_alphabar = 0.0f64;
    for t in 0..len {
        let beta = (beta2 - beta1) * t as f64 / n_t as f64 + beta1;
        let alpha = 1.0 - beta;
        log_alphabar += alpha.ln();
        let alphabar = log_alphabar.exp();
        let sqrtmab = (1.0 - alphabar).sqrt();

        s.beta_t.push(beta as f32);
        s.sqrt_beta_t.push(beta.sqrt() as f32);
        s.alpha_t.push(alpha as f32);
        s.oneover_sqrta.push((1.0 / alpha.sqrt()) as f32);
        s.alphabar_t.push(alphabar as f32);
        s.sqrtab.push(alphabar.sqrt() as f32);
        s.sqrtmab.push(sqrtmab as f32);
        s.mab_over_sqrtmab.push(((1.0 - alpha) / sqrtmab) as f32);
    }
    Ok(s)
}
