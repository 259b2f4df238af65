// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 sdrx developers

//! Small complex-arithmetic kit for the calibration DSP.
//!
//! Sample buffers use [`Cf32`]; the narrow-band correlations run in
//! [`Cf64`] so accumulation error stays below the decision thresholds.

use std::ops::{Add, AddAssign, Mul, Sub};

/// Complex sample, single precision.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Cf32 {
    /// Real (I) part.
    pub re: f32,
    /// Imaginary (Q) part.
    pub im: f32,
}

/// Complex accumulator, double precision.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Cf64 {
    /// Real part.
    pub re: f64,
    /// Imaginary part.
    pub im: f64,
}

impl Cf32 {
    /// Construct from parts.
    #[inline]
    #[must_use]
    pub const fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }

    /// `|z|^2`.
    #[inline]
    #[must_use]
    pub fn norm_sqr(self) -> f32 {
        self.re * self.re + self.im * self.im
    }

    /// Widen to double precision.
    #[inline]
    #[must_use]
    pub fn widen(self) -> Cf64 {
        Cf64 {
            re: f64::from(self.re),
            im: f64::from(self.im),
        }
    }
}

impl Cf64 {
    /// Construct from parts.
    #[inline]
    #[must_use]
    pub const fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }

    /// `e^(j*phi)`.
    #[inline]
    #[must_use]
    pub fn exp_j(phi: f64) -> Self {
        Self {
            re: phi.cos(),
            im: phi.sin(),
        }
    }

    /// Complex conjugate.
    #[inline]
    #[must_use]
    pub fn conj(self) -> Self {
        Self {
            re: self.re,
            im: -self.im,
        }
    }

    /// `|z|^2`.
    #[inline]
    #[must_use]
    pub fn norm_sqr(self) -> f64 {
        self.re * self.re + self.im * self.im
    }

    /// `|z|`.
    #[inline]
    #[must_use]
    pub fn abs(self) -> f64 {
        self.norm_sqr().sqrt()
    }

    /// Argument in radians.
    #[inline]
    #[must_use]
    pub fn arg(self) -> f64 {
        self.im.atan2(self.re)
    }

    /// Scale by a real factor.
    #[inline]
    #[must_use]
    pub fn scale(self, k: f64) -> Self {
        Self {
            re: self.re * k,
            im: self.im * k,
        }
    }

    /// Complex division.
    #[inline]
    #[must_use]
    pub fn div(self, rhs: Self) -> Self {
        let d = rhs.norm_sqr();
        (self * rhs.conj()).scale(1.0 / d)
    }

    /// Narrow to single precision.
    #[inline]
    #[must_use]
    pub fn narrow(self) -> Cf32 {
        Cf32 {
            re: self.re as f32,
            im: self.im as f32,
        }
    }
}

impl Add for Cf32 {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self::new(self.re + rhs.re, self.im + rhs.im)
    }
}

impl Sub for Cf32 {
    type Output = Self;
    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.re - rhs.re, self.im - rhs.im)
    }
}

impl Mul for Cf32 {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.re * rhs.re - self.im * rhs.im,
            self.re * rhs.im + self.im * rhs.re,
        )
    }
}

impl Mul<f32> for Cf32 {
    type Output = Self;
    #[inline]
    fn mul(self, k: f32) -> Self {
        Self::new(self.re * k, self.im * k)
    }
}

impl AddAssign for Cf32 {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        self.re += rhs.re;
        self.im += rhs.im;
    }
}

impl Add for Cf64 {
    type Output = Self;
    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self::new(self.re + rhs.re, self.im + rhs.im)
    }
}

impl AddAssign for Cf64 {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        self.re += rhs.re;
        self.im += rhs.im;
    }
}

impl Mul for Cf64 {
    type Output = Self;
    #[inline]
    fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.re * rhs.re - self.im * rhs.im,
            self.re * rhs.im + self.im * rhs.re,
        )
    }
}

/// Generate `n` samples of `e^(j*omega*k)`, `omega` in radians/sample.
#[must_use]
pub fn tone(omega: f64, n: usize) -> Vec<Cf64> {
    (0..n).map(|k| Cf64::exp_j(omega * k as f64)).collect()
}

/// Correlation energy of `buf` against a reference tone:
/// `|sum(tone[k] * buf[k])|^2 / n`.
#[must_use]
pub fn correlate_energy(tone: &[Cf64], buf: &[Cf32]) -> f64 {
    let n = tone.len().min(buf.len());
    if n == 0 {
        return 0.0;
    }
    let mut acc = Cf64::default();
    for k in 0..n {
        acc += tone[k] * buf[k].widen();
    }
    acc.norm_sqr() / n as f64
}

/// Total energy `sum(|buf[k]|^2)`.
#[must_use]
pub fn total_energy(buf: &[Cf32]) -> f64 {
    buf.iter().map(|s| f64::from(s.norm_sqr())).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    #[test]
    fn test_exp_j_unit_circle() {
        let z = Cf64::exp_j(PI / 2.0);
        assert!(z.re.abs() < 1e-12);
        assert!((z.im - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_correlate_picks_matching_tone() {
        let n = 1024;
        let omega = PI / 4.0;
        let reference = tone(-omega, n);
        let buf: Vec<Cf32> = tone(omega, n).iter().map(|z| z.narrow()).collect();
        let matched = correlate_energy(&reference, &buf);
        // Energy of a matched unit tone is n; an orthogonal tone is near zero.
        assert!((matched - n as f64).abs() / (n as f64) < 1e-3);
        let orthogonal = correlate_energy(&tone(omega, n), &buf);
        assert!(orthogonal < 1e-3 * matched);
    }

    #[test]
    fn test_total_energy() {
        let buf = vec![Cf32::new(1.0, 0.0); 16];
        assert!((total_energy(&buf) - 16.0).abs() < 1e-9);
    }

    #[test]
    fn test_complex_div() {
        let a = Cf64::new(2.0, 2.0);
        let b = Cf64::new(0.0, 2.0);
        let q = a.div(b);
        assert!((q.re - 1.0).abs() < 1e-12);
        assert!((q.im + 1.0).abs() < 1e-12);
    }
}
