//! Mode-coupling (mixing) matrices from mask spectra.
//!
//! Masked-sky spectra relate to full-sky spectra through a linear
//! mode-coupling operator computed from the masks' own angular power.
//! The bookkeeping here walks every mask spectrum and every pair of
//! fields sharing those masks; the dense convolution itself is
//! delegated through the [`ConvolveKernel`] seam, with
//! [`WignerKernel`] as the bundled implementation.

use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;

use ndarray::{Array2, ArrayView1};
use tracing::debug;

use crate::error::Result;
use crate::fields::Field;
use crate::toc::{ClKey, Toc};
use crate::twopoint::{bin2pt, Binned, ClWeights, Spectrum};
use crate::wigner::wigner3j_range;

/// Dense convolution backend for mode-coupling matrices.
pub trait ConvolveKernel {
    /// Mixing matrix for a field pair with at least one zero spin.
    fn mixmat(
        &self,
        cl: ArrayView1<f64>,
        l1max: usize,
        l2max: usize,
        l3max: Option<usize>,
        spins: (i32, i32),
    ) -> Array2<f64>;

    /// E/B-decomposed mixing matrices `(EE, BB, EB)` for a pair of
    /// nonzero-spin fields.
    fn mixmat_eb(
        &self,
        cl: ArrayView1<f64>,
        l1max: usize,
        l2max: usize,
        l3max: Option<usize>,
        spins: (i32, i32),
    ) -> (Array2<f64>, Array2<f64>, Array2<f64>);
}

/// Mode-coupling kernel evaluated through Wigner 3j recursions:
/// `M_{l1 l2} = (2 l2 + 1)/(4π) Σ_{l3} (2 l3 + 1) W_{l3} ξ_{s1} ξ_{s2}`
/// with `ξ_s = (l1 l2 l3; s -s 0)`.
pub struct WignerKernel;

impl ConvolveKernel for WignerKernel {
    fn mixmat(
        &self,
        cl: ArrayView1<f64>,
        l1max: usize,
        l2max: usize,
        l3max: Option<usize>,
        spins: (i32, i32),
    ) -> Array2<f64> {
        let l3cut = l3max
            .unwrap_or(cl.len().saturating_sub(1))
            .min(cl.len().saturating_sub(1));
        let mut out = Array2::<f64>::zeros((l1max + 1, l2max + 1));
        for l1 in 0..=l1max {
            for l2 in 0..=l2max {
                let (l3min, xi1) = wigner3j_range(l1 as u32, l2 as u32, spins.0, -spins.0);
                let xi2 = if spins.1 == spins.0 {
                    None
                } else {
                    Some(wigner3j_range(l1 as u32, l2 as u32, spins.1, -spins.1).1)
                };
                let mut sum = 0.0;
                for (k, &x1) in xi1.iter().enumerate() {
                    let l3 = l3min as usize + k;
                    if l3 > l3cut {
                        break;
                    }
                    // a spin-2 family is empty below l = 2
                    let x2 = match &xi2 {
                        None => x1,
                        Some(v) => v.get(k).copied().unwrap_or(0.0),
                    };
                    sum += (2 * l3 + 1) as f64 * cl[l3] * x1 * x2;
                }
                out[[l1, l2]] = (2 * l2 + 1) as f64 / (4.0 * PI) * sum;
            }
        }
        out
    }

    fn mixmat_eb(
        &self,
        cl: ArrayView1<f64>,
        l1max: usize,
        l2max: usize,
        l3max: Option<usize>,
        spins: (i32, i32),
    ) -> (Array2<f64>, Array2<f64>, Array2<f64>) {
        let l3cut = l3max
            .unwrap_or(cl.len().saturating_sub(1))
            .min(cl.len().saturating_sub(1));
        let mut ee = Array2::<f64>::zeros((l1max + 1, l2max + 1));
        let mut bb = Array2::<f64>::zeros((l1max + 1, l2max + 1));
        let mut eb = Array2::<f64>::zeros((l1max + 1, l2max + 1));
        for l1 in 0..=l1max {
            for l2 in 0..=l2max {
                let (l3min, xi1) = wigner3j_range(l1 as u32, l2 as u32, spins.0, -spins.0);
                let xi2 = if spins.1 == spins.0 {
                    None
                } else {
                    Some(wigner3j_range(l1 as u32, l2 as u32, spins.1, -spins.1).1)
                };
                let mut even = 0.0;
                let mut odd = 0.0;
                for (k, &x1) in xi1.iter().enumerate() {
                    let l3 = l3min as usize + k;
                    if l3 > l3cut {
                        break;
                    }
                    let x2 = match &xi2 {
                        None => x1,
                        Some(v) => v.get(k).copied().unwrap_or(0.0),
                    };
                    let term = (2 * l3 + 1) as f64 * cl[l3] * x1 * x2;
                    if (l1 + l2 + l3) % 2 == 0 {
                        even += term;
                    } else {
                        odd += term;
                    }
                }
                let prefactor = (2 * l2 + 1) as f64 / (4.0 * PI);
                ee[[l1, l2]] = prefactor * even;
                bb[[l1, l2]] = prefactor * odd;
                eb[[l1, l2]] = prefactor * (even - odd);
            }
        }
        (ee, bb, eb)
    }
}

/// Options for [`mixing_matrices`].
#[derive(Default)]
pub struct MixingOptions {
    pub l1max: Option<u32>,
    pub l2max: Option<u32>,
    pub l3max: Option<u32>,
}

/// Compute mode-coupling matrices for fields from a set of mask
/// spectra.
///
/// Fields are grouped by their mask names; every mask auto/cross
/// spectrum produces one matrix per pair of fields sharing those
/// masks, with symmetric duplicates computed once. A pair with at
/// least one zero spin yields a single matrix (spin-2 sides named
/// with an `_E` suffix); two nonzero spins yield the `(EE, BB, EB)`
/// expansion.
pub fn mixing_matrices(
    fields: &[(&str, &Field)],
    cls: &Toc<ClKey, Spectrum>,
    kernel: &dyn ConvolveKernel,
    options: &MixingOptions,
) -> Toc<ClKey, Array2<f64>> {
    // inverse mapping of mask names to fields
    let mut masks: HashMap<&str, Vec<(&str, i32)>> = HashMap::new();
    for &(name, field) in fields {
        if let Some(mask) = field.mask() {
            masks.entry(mask).or_default().push((name, field.spin()));
        }
    }

    let mut out = Toc::new();
    let mut done: HashSet<ClKey> = HashSet::new();

    for (key, spectrum) in cls {
        let (fields1, fields2) = match (
            masks.get(key.field1.as_str()),
            masks.get(key.field2.as_str()),
        ) {
            (Some(f1), Some(f2)) => (f1, f2),
            _ => continue,
        };
        let cl = spectrum.values();
        let default_lmax = cl.len().saturating_sub(1);
        let l1max = options.l1max.map_or(default_lmax, |l| l as usize);
        let l2max = options.l2max.map_or(default_lmax, |l| l as usize);
        let l3max = options.l3max.map(|l| l as usize);

        for &(f1, spin1) in fields1 {
            for &(f2, spin2) in fields2 {
                let pair = ClKey::new(f1, f2, key.bin1, key.bin2);
                if done.contains(&pair) || done.contains(&pair.swapped()) {
                    continue;
                }
                done.insert(pair);

                debug!(f1, f2, spin1, spin2, "computing mixing matrix");
                if spin1 == 0 || spin2 == 0 {
                    let mm = kernel.mixmat(cl, l1max, l2max, l3max, (spin1, spin2));
                    let name1 = if spin1 == 0 {
                        f1.to_owned()
                    } else {
                        format!("{f1}_E")
                    };
                    let name2 = if spin2 == 0 {
                        f2.to_owned()
                    } else {
                        format!("{f2}_E")
                    };
                    out.insert(ClKey::new(name1, name2, key.bin1, key.bin2), mm);
                } else {
                    let (ee, bb, eb) = kernel.mixmat_eb(cl, l1max, l2max, l3max, (spin1, spin2));
                    out.insert(
                        ClKey::new(format!("{f1}_E"), format!("{f2}_E"), key.bin1, key.bin2),
                        ee,
                    );
                    out.insert(
                        ClKey::new(format!("{f1}_B"), format!("{f2}_B"), key.bin1, key.bin2),
                        bb,
                    );
                    out.insert(
                        ClKey::new(format!("{f1}_E"), format!("{f2}_B"), key.bin1, key.bin2),
                        eb,
                    );
                }
            }
        }
    }
    out
}

/// Bin a set of mixing matrices over their first mode axis.
pub fn binned_mms(
    mms: &Toc<ClKey, Array2<f64>>,
    edges: ArrayView1<f64>,
    weights: &ClWeights,
) -> Result<Toc<ClKey, Binned>> {
    let mut out = Toc::new();
    for (key, mm) in mms {
        out.insert(key.clone(), bin2pt(mm.view().into_dyn(), edges, weights)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{Kernel, Metadata};
    use crate::mapper::HealpixMapper;
    use crate::twopoint::{ClData, SpectrumMeta};
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use ndarray::{array, Array1};

    /// Mask spectrum of a full-sky unit mask: all power in the
    /// monopole, `W_0 = 4π`.
    fn full_sky_cl(lmax: usize) -> Array1<f64> {
        let mut cl = Array1::<f64>::zeros(lmax + 1);
        cl[0] = 4.0 * PI;
        cl
    }

    fn spectrum(cl: Array1<f64>) -> Spectrum {
        let meta = Metadata::new(Kernel::Healpix, 16, 0);
        Spectrum {
            data: ClData::Raw(cl),
            meta: SpectrumMeta {
                meta_1: meta.clone(),
                meta_2: meta,
                bias: None,
            },
        }
    }

    #[test]
    fn test_full_sky_mixmat_is_identity() {
        let kernel = WignerKernel;
        let mm = kernel.mixmat(full_sky_cl(10).view(), 8, 8, None, (0, 0));
        for l1 in 0..=8usize {
            for l2 in 0..=8usize {
                let expected = if l1 == l2 { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(mm[[l1, l2]], expected, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_full_sky_mixmat_eb() {
        let kernel = WignerKernel;
        let (ee, bb, eb) = kernel.mixmat_eb(full_sky_cl(10).view(), 8, 8, None, (2, 2));
        for l1 in 0..=8usize {
            for l2 in 0..=8usize {
                // l3 = 0 forces l1 = l2 and even parity: EE and EB
                // are the identity on l >= 2, BB vanishes
                let expected = if l1 == l2 && l1 >= 2 { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(ee[[l1, l2]], expected, epsilon = 1e-10);
                assert_abs_diff_eq!(eb[[l1, l2]], expected, epsilon = 1e-10);
                assert_abs_diff_eq!(bb[[l1, l2]], 0.0, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_mixmat_row_sum_rule() {
        // for any mask, Σ_{l2} M_{l1 l2} = Σ_{l3} (2l3+1) W_{l3} / 4π
        // once l1 is far enough from the boundary (spin 0)
        let kernel = WignerKernel;
        let cl = array![4.0 * PI, 2.0, 1.0, 0.5, 0.25];
        let mm = kernel.mixmat(cl.view(), 12, 24, None, (0, 0));
        let expected: f64 = cl
            .iter()
            .enumerate()
            .map(|(l3, w)| (2 * l3 + 1) as f64 * w)
            .sum::<f64>()
            / (4.0 * PI);
        for l1 in 4..=12usize {
            let row: f64 = mm.row(l1).sum();
            assert_relative_eq!(row, expected, max_relative = 1e-8);
        }
    }

    fn test_fields(nside: u32) -> (Field, Field) {
        let mapper = HealpixMapper::new(nside);
        let pos = Field::positions(mapper.clone(), "ra", "dec").with_mask("V");
        let she = Field::spin2(mapper, "ra", "dec", "g1", "g2", None).with_mask("W");
        (pos, she)
    }

    #[test]
    fn test_mixing_matrices_dispatch() {
        let (pos, she) = test_fields(4);
        let fields: Vec<(&str, &Field)> = vec![("P", &pos), ("G", &she)];
        let kernel = WignerKernel;

        // mask auto-spectrum of V: one spin-0 matrix
        let mut cls: Toc<ClKey, Spectrum> = Toc::new();
        cls.insert(ClKey::new("V", "V", 0, 1), spectrum(full_sky_cl(6)));
        let mms = mixing_matrices(&fields, &cls, &kernel, &MixingOptions::default());
        assert_eq!(mms.len(), 1);
        assert!(mms.contains_key(&ClKey::new("P", "P", 0, 1)));

        // V x W cross: P x G_E matrix
        let mut cls: Toc<ClKey, Spectrum> = Toc::new();
        cls.insert(ClKey::new("V", "W", 0, 1), spectrum(full_sky_cl(6)));
        let mms = mixing_matrices(&fields, &cls, &kernel, &MixingOptions::default());
        assert_eq!(mms.len(), 1);
        assert!(mms.contains_key(&ClKey::new("P", "G_E", 0, 1)));

        // W auto: E/B triple
        let mut cls: Toc<ClKey, Spectrum> = Toc::new();
        cls.insert(ClKey::new("W", "W", 0, 1), spectrum(full_sky_cl(6)));
        let mms = mixing_matrices(&fields, &cls, &kernel, &MixingOptions::default());
        assert_eq!(mms.len(), 3);
        assert!(mms.contains_key(&ClKey::new("G_E", "G_E", 0, 1)));
        assert!(mms.contains_key(&ClKey::new("G_B", "G_B", 0, 1)));
        assert!(mms.contains_key(&ClKey::new("G_E", "G_B", 0, 1)));

        // unknown masks are skipped
        let mut cls: Toc<ClKey, Spectrum> = Toc::new();
        cls.insert(ClKey::new("X", "Y", 0, 1), spectrum(full_sky_cl(6)));
        let mms = mixing_matrices(&fields, &cls, &kernel, &MixingOptions::default());
        assert!(mms.is_empty());
    }

    #[test]
    fn test_mixing_matrices_symmetric_pairs_once() {
        let (pos, _) = test_fields(4);
        let mapper = HealpixMapper::new(4);
        let she = Field::spin2(mapper, "ra", "dec", "g1", "g2", None).with_mask("V");
        let fields: Vec<(&str, &Field)> = vec![("P", &pos), ("G", &she)];
        let kernel = WignerKernel;

        // both fields share mask V: the (P, G) pair appears once even
        // though the product enumerates it twice
        let mut cls: Toc<ClKey, Spectrum> = Toc::new();
        cls.insert(ClKey::new("V", "V", 0, 0), spectrum(full_sky_cl(6)));
        let mms = mixing_matrices(&fields, &cls, &kernel, &MixingOptions::default());

        // P-P, P-G_E, and the G-G triple
        assert_eq!(mms.len(), 5);
        assert!(mms.contains_key(&ClKey::new("P", "G_E", 0, 0)));
        assert!(!mms.contains_key(&ClKey::new("G_E", "P", 0, 0)));
    }

    #[test]
    fn test_binned_mms_shapes() {
        let kernel = WignerKernel;
        let mm = kernel.mixmat(full_sky_cl(10).view(), 20, 10, None, (0, 0));
        let mut mms: Toc<ClKey, Array2<f64>> = Toc::new();
        mms.insert(ClKey::new("P", "P", 0, 0), mm);

        let edges = array![2.0, 5.0, 10.0, 15.0, 20.0];
        let binned = binned_mms(&mms, edges.view(), &ClWeights::Uniform).unwrap();
        let entry = binned.get(&ClKey::new("P", "P", 0, 0)).unwrap();
        assert_eq!(entry.data.shape(), &[4, 11]);
        assert_eq!(entry.weight.len(), 4);
    }

    #[test]
    fn test_mixmat_l3max_clips_mask_power() {
        let kernel = WignerKernel;
        let mut cl = full_sky_cl(6);
        cl[4] = 1.0;
        // clipping at l3 = 0 leaves only the monopole contribution
        let clipped = kernel.mixmat(cl.view(), 4, 4, Some(0), (0, 0));
        let identity = kernel.mixmat(full_sky_cl(6).view(), 4, 4, None, (0, 0));
        for l1 in 0..=4usize {
            for l2 in 0..=4usize {
                assert_abs_diff_eq!(clipped[[l1, l2]], identity[[l1, l2]], epsilon = 1e-10);
            }
        }
    }
}
