//! Direct spherical-harmonic analysis on HEALPix grids.
//!
//! Quadrature analysis with equal per-cell weights `4π/npix`. Scalar
//! fields use the standard three-term recursion of the normalized
//! associated Legendre functions; spin-2 fields use the Wigner-d
//! three-term recursion in `l` with closed-form seeds at
//! `l = max(m, 2)`. Cost is `O(npix · lmax²)`, which keeps the crate
//! free of an external transform dependency; the [`crate::mapper`]
//! seam allows swapping in a faster backend.

use std::f64::consts::PI;

use ndarray::{Array1, ArrayView1};
use num_complex::Complex64;
use scorus::healpix::pix::pix2ang_ring;
use scorus::healpix::utils::nside2npix;

use crate::map::{alm_size, Alm};

/// 1 / sqrt(4π), the l = m = 0 normalized Legendre value.
const LAMBDA_00: f64 = 0.28209479177387814;

struct PixelGrid {
    cth: Vec<f64>,
    sth: Vec<f64>,
    /// cos(θ/2) and sin(θ/2) for the Wigner-d seeds.
    chalf: Vec<f64>,
    shalf: Vec<f64>,
    /// e^{-iφ} per pixel.
    expmphi: Vec<Complex64>,
}

impl PixelGrid {
    fn new(nside: u32) -> Self {
        let npix = nside2npix(nside as usize);
        let mut cth = Vec::with_capacity(npix);
        let mut sth = Vec::with_capacity(npix);
        let mut chalf = Vec::with_capacity(npix);
        let mut shalf = Vec::with_capacity(npix);
        let mut expmphi = Vec::with_capacity(npix);
        for p in 0..npix {
            let ang = pix2ang_ring::<f64>(nside as usize, p);
            cth.push(ang.pol.cos());
            sth.push(ang.pol.sin());
            chalf.push((ang.pol / 2.0).cos());
            shalf.push((ang.pol / 2.0).sin());
            expmphi.push(Complex64::from_polar(1.0, -ang.az));
        }
        Self {
            cth,
            sth,
            chalf,
            shalf,
            expmphi,
        }
    }

    fn npix(&self) -> usize {
        self.cth.len()
    }
}

/// Forward scalar analysis: `a_lm = Ω Σ_p f_p Y*_lm(p)`.
pub fn analyze_scalar(nside: u32, map: ArrayView1<f64>, lmax: u32) -> Array1<Complex64> {
    let grid = PixelGrid::new(nside);
    let npix = grid.npix();
    assert_eq!(map.len(), npix, "map length does not match nside");
    let map = map.as_standard_layout();

    let area = 4.0 * PI / npix as f64;
    let lmax_us = lmax as usize;
    let mut alm = Array1::<Complex64>::zeros(alm_size(lmax));

    // λ_{m,m} and e^{-imφ} per pixel, advanced once per m.
    let mut lam_mm = vec![LAMBDA_00; npix];
    let mut phase = vec![Complex64::new(1.0, 0.0); npix];

    for m in 0..=lmax_us {
        if m > 0 {
            let c = -((2 * m + 1) as f64 / (2 * m) as f64).sqrt();
            for p in 0..npix {
                lam_mm[p] *= c * grid.sth[p];
                phase[p] *= grid.expmphi[p];
            }
        }

        // recursion coefficients for l = m+2 ..= lmax
        let mf = m as f64;
        let rec: Vec<(f64, f64)> = ((m + 2)..=lmax_us)
            .map(|l| {
                let lf = l as f64;
                let a = ((4.0 * lf * lf - 1.0) / (lf * lf - mf * mf)).sqrt();
                let b = (((lf - 1.0) * (lf - 1.0) - mf * mf)
                    / (4.0 * (lf - 1.0) * (lf - 1.0) - 1.0))
                    .sqrt();
                (a, b)
            })
            .collect();

        let base = Alm::index(lmax, m as u32, m as u32);
        for p in 0..npix {
            let f = map[p];
            if f == 0.0 {
                continue;
            }
            let fz = phase[p] * (f * area);
            let x = grid.cth[p];

            let mut lam0 = lam_mm[p];
            alm[base] += fz * lam0;
            if m < lmax_us {
                let mut lam1 = x * ((2 * m + 3) as f64).sqrt() * lam0;
                alm[base + 1] += fz * lam1;
                for (k, &(a, b)) in rec.iter().enumerate() {
                    let lam2 = a * (x * lam1 - b * lam0);
                    alm[base + 2 + k] += fz * lam2;
                    lam0 = lam1;
                    lam1 = lam2;
                }
            }
        }
    }

    alm
}

/// Forward spin-2 analysis of a real two-component field.
///
/// Returns the (E, B) coefficient pair from the spin ±2 expansions of
/// `Q ± iU`: `E = −(a₊ + a₋)/2`, `B = i(a₊ − a₋)/2`.
pub fn analyze_spin2(
    nside: u32,
    q: ArrayView1<f64>,
    u: ArrayView1<f64>,
    lmax: u32,
) -> (Array1<Complex64>, Array1<Complex64>) {
    let grid = PixelGrid::new(nside);
    let npix = grid.npix();
    assert_eq!(q.len(), npix, "Q length does not match nside");
    assert_eq!(u.len(), npix, "U length does not match nside");
    let q = q.as_standard_layout();
    let u = u.as_standard_layout();

    let area = 4.0 * PI / npix as f64;
    let lmax_us = lmax as usize;
    let lnfact = ln_factorials(2 * lmax_us + 1);

    // spin +2 and spin -2 expansions
    let mut a_p2 = Array1::<Complex64>::zeros(alm_size(lmax));
    let mut a_m2 = Array1::<Complex64>::zeros(alm_size(lmax));

    let mut phase = vec![Complex64::new(1.0, 0.0); npix];

    for m in 0..=lmax_us {
        if m > 0 {
            for p in 0..npix {
                phase[p] *= grid.expmphi[p];
            }
        }
        let lmin = m.max(2);
        if lmin > lmax_us {
            continue;
        }

        // l-independent parts of the recursion coefficients: the
        // d-function first index is -m, the second ±2, so the square
        // roots only involve m² and 4.
        let mf = m as f64;
        let sqr: Vec<(f64, f64)> = (lmin..lmax_us)
            .map(|l| {
                let lf = l as f64;
                let l1 = lf + 1.0;
                let s2 = ((lf * lf - mf * mf) * (lf * lf - 4.0)).sqrt();
                let s3 = ((l1 * l1 - mf * mf) * (l1 * l1 - 4.0)).sqrt();
                (s2, s3)
            })
            .collect();

        let sign_m = if m % 2 == 0 { 1.0 } else { -1.0 };
        let base = Alm::index(lmax, lmin as u32, m as u32);

        for p in 0..npix {
            let (qp, up) = (q[p], u[p]);
            if qp == 0.0 && up == 0.0 {
                continue;
            }
            let f_plus = phase[p] * Complex64::new(qp * area, up * area);
            let f_minus = phase[p] * Complex64::new(qp * area, -up * area);
            let x = grid.cth[p];

            // seeds at l = lmin for n = -2 and n = +2
            let d_seed = |n: i32| -> f64 {
                wigner_d_seed(m, n, x, grid.sth[p], grid.chalf[p], grid.shalf[p], &lnfact)
            };
            let mut dm_prev = 0.0; // d^{l-1}_{-m,-2}
            let mut dp_prev = 0.0; // d^{l-1}_{-m,+2}
            let mut dm = d_seed(-2);
            let mut dp = d_seed(2);

            for (k, l) in (lmin..=lmax_us).enumerate() {
                let lf = l as f64;
                let norm = sign_m * ((2.0 * lf + 1.0) / (4.0 * PI)).sqrt();
                a_p2[base + k] += f_plus * (norm * dm);
                a_m2[base + k] += f_minus * (norm * dp);

                if l < lmax_us {
                    let (s2, s3) = sqr[k];
                    // first index -m, second index n: the mn product
                    // is -m·n, i.e. +2m for n = -2 and -2m for n = +2
                    let c_m = (2.0 * lf + 1.0) * (lf * (lf + 1.0) * x - 2.0 * mf);
                    let c_p = (2.0 * lf + 1.0) * (lf * (lf + 1.0) * x + 2.0 * mf);
                    let dm_next = (c_m * dm - (lf + 1.0) * s2 * dm_prev) / (lf * s3);
                    let dp_next = (c_p * dp - (lf + 1.0) * s2 * dp_prev) / (lf * s3);
                    dm_prev = dm;
                    dp_prev = dp;
                    dm = dm_next;
                    dp = dp_next;
                }
            }
        }
    }

    let e = (&a_p2 + &a_m2).mapv(|v| -0.5 * v);
    let b = (&a_p2 - &a_m2).mapv(|v| Complex64::new(0.0, 0.5) * v);
    (e, b)
}

/// Seed value `d^{lmin}_{-m,n}` of the Wigner-d recursion, with
/// `lmin = max(m, 2)` and `n = ±2`.
fn wigner_d_seed(
    m: usize,
    n: i32,
    cth: f64,
    sth: f64,
    chalf: f64,
    shalf: f64,
    lnfact: &[f64],
) -> f64 {
    debug_assert!(n == 2 || n == -2);
    match m {
        0 => 0.25 * 6.0_f64.sqrt() * sth * sth,
        1 => {
            if n == 2 {
                0.5 * sth * (1.0 - cth)
            } else {
                -0.5 * sth * (1.0 + cth)
            }
        }
        _ => {
            // d^m_{-m,n} = (-1)^{m+n} √C(2m, m+n) cos^{m-n}(θ/2) sin^{m+n}(θ/2)
            let (mp, mn) = ((m as i32 + n) as usize, (m as i32 - n) as usize);
            if shalf <= 0.0 || chalf <= 0.0 {
                return 0.0;
            }
            let ln_k = 0.5 * (lnfact[2 * m] - lnfact[mp] - lnfact[mn]);
            let magnitude = (ln_k + mn as f64 * chalf.ln() + mp as f64 * shalf.ln()).exp();
            if m % 2 == 0 {
                magnitude
            } else {
                -magnitude
            }
        }
    }
}

/// Table of ln(k!) for k = 0..=n.
fn ln_factorials(n: usize) -> Vec<f64> {
    let mut table = Vec::with_capacity(n + 1);
    let mut acc = 0.0;
    table.push(0.0);
    for k in 1..=n {
        acc += (k as f64).ln();
        table.push(acc);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::Array1;

    fn pixel_angles(nside: u32) -> Vec<(f64, f64)> {
        let npix = nside2npix(nside as usize);
        (0..npix)
            .map(|p| {
                let ang = pix2ang_ring::<f64>(nside as usize, p);
                (ang.pol, ang.az)
            })
            .collect()
    }

    #[test]
    fn test_constant_map_is_pure_monopole() {
        let nside = 8;
        let npix = nside2npix(nside as usize);
        let c = 2.5;
        let map = Array1::from_elem(npix, c);

        let alm = analyze_scalar(nside, map.view(), 8);

        // a_00 = c √(4π) exactly, since the cell areas sum to 4π
        let a00 = alm[0];
        assert_relative_eq!(a00.re, c * (4.0 * PI).sqrt(), max_relative = 1e-12);
        assert_abs_diff_eq!(a00.im, 0.0, epsilon = 1e-12);

        // everything else is quadrature error, far below the monopole
        for (i, &a) in alm.iter().enumerate() {
            if i != 0 {
                assert!(
                    a.norm() < 1e-2 * a00.norm(),
                    "coefficient {i} too large: {a}"
                );
            }
        }
    }

    #[test]
    fn test_cos_theta_map_is_dipole() {
        let nside = 16;
        let angles = pixel_angles(nside);
        let map: Array1<f64> = angles.iter().map(|&(theta, _)| theta.cos()).collect();

        let alm = analyze_scalar(nside, map.view(), 8);

        // cos θ = √(4π/3) Y_10
        let expected = (4.0 * PI / 3.0).sqrt();
        let a10 = alm[Alm::index(8, 1, 0)];
        assert_relative_eq!(a10.re, expected, max_relative = 1e-2);
        for l in [0u32, 2, 3, 4] {
            let a = alm[Alm::index(8, l, 0)];
            assert!(a.norm() < 1e-2 * expected, "l={l} leaked: {a}");
        }
    }

    #[test]
    fn test_sectoral_harmonic_recovered() {
        // map = Re Y_22 has its power in (l, m) = (2, 2)
        let nside = 16;
        let lmax = 6;
        let angles = pixel_angles(nside);
        let norm = 0.25 * (15.0 / (2.0 * PI)).sqrt();
        let map: Array1<f64> = angles
            .iter()
            .map(|&(theta, phi)| norm * theta.sin().powi(2) * (2.0 * phi).cos())
            .collect();

        let alm = analyze_scalar(nside, map.view(), lmax);

        // Re Y_22 = (Y_22 + Y_2-2)/2, so a_22 = 1/2
        let a22 = alm[Alm::index(lmax, 2, 2)];
        assert_relative_eq!(a22.re, 0.5, max_relative = 1e-2);
        assert_abs_diff_eq!(a22.im, 0.0, epsilon = 1e-4);
        let a21 = alm[Alm::index(lmax, 2, 1)];
        assert!(a21.norm() < 1e-4);
    }

    #[test]
    fn test_spin2_polarization_rotation_swaps_e_and_b() {
        // (Q, U) -> (-U, Q) must map (E, B) -> (-B, E) exactly at the
        // discrete level, independent of quadrature accuracy
        let nside = 8;
        let npix = nside2npix(nside as usize);
        let lmax = 12;
        let angles = pixel_angles(nside);

        let q: Array1<f64> = angles
            .iter()
            .map(|&(theta, phi)| theta.sin().powi(2) * phi.cos())
            .collect();
        let u: Array1<f64> = (0..npix)
            .map(|p| (0.1 * p as f64).sin())
            .collect();

        let (e1, b1) = analyze_spin2(nside, q.view(), u.view(), lmax);
        let neg_u = u.mapv(|v| -v);
        let (e2, b2) = analyze_spin2(nside, neg_u.view(), q.view(), lmax);

        for i in 0..e1.len() {
            assert_abs_diff_eq!(e2[i].re, -b1[i].re, epsilon = 1e-12);
            assert_abs_diff_eq!(e2[i].im, -b1[i].im, epsilon = 1e-12);
            assert_abs_diff_eq!(b2[i].re, e1[i].re, epsilon = 1e-12);
            assert_abs_diff_eq!(b2[i].im, e1[i].im, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_spin2_linearity() {
        let nside = 4;
        let npix = nside2npix(nside as usize);
        let lmax = 8;

        let q1: Array1<f64> = (0..npix).map(|p| (0.3 * p as f64).cos()).collect();
        let u1: Array1<f64> = (0..npix).map(|p| (0.7 * p as f64).sin()).collect();
        let q2 = q1.mapv(|v| 2.0 * v);
        let u2 = u1.mapv(|v| 2.0 * v);

        let (e1, b1) = analyze_spin2(nside, q1.view(), u1.view(), lmax);
        let (e2, b2) = analyze_spin2(nside, q2.view(), u2.view(), lmax);

        for i in 0..e1.len() {
            assert_abs_diff_eq!(e2[i].re, 2.0 * e1[i].re, epsilon = 1e-12);
            assert_abs_diff_eq!(b2[i].im, 2.0 * b1[i].im, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_wigner_d_seed_matches_table() {
        // spot-check the m >= 2 closed form against the j = 2 table
        let theta: f64 = 1.1;
        let (cth, sth) = (theta.cos(), theta.sin());
        let (chalf, shalf) = ((theta / 2.0).cos(), (theta / 2.0).sin());
        let lnfact = ln_factorials(8);

        // d²_{-2,2} = sin⁴(θ/2), d²_{-2,-2} = cos⁴(θ/2)
        let d_plus = wigner_d_seed(2, 2, cth, sth, chalf, shalf, &lnfact);
        let d_minus = wigner_d_seed(2, -2, cth, sth, chalf, shalf, &lnfact);
        assert_relative_eq!(d_plus, shalf.powi(4), max_relative = 1e-12);
        assert_relative_eq!(d_minus, chalf.powi(4), max_relative = 1e-12);
        assert_relative_eq!(d_plus, 0.25 * (1.0 - cth).powi(2), max_relative = 1e-12);
    }

    #[test]
    fn test_monopole_invariant_under_band_limit() {
        let nside = 4;
        let npix = nside2npix(nside as usize);
        let map = Array1::from_elem(npix, 1.0);

        let alm_lo = analyze_scalar(nside, map.view(), 4);
        let alm_hi = analyze_scalar(nside, map.view(), 10);
        assert_relative_eq!(alm_lo[0].re, alm_hi[0].re, max_relative = 1e-14);
    }
}
