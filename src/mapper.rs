//! Pixelization abstraction and the HEALPix mapper.
//!
//! A [`Mapper`] defines a discretized sky geometry: it turns angular
//! positions into cell indices, accumulates batches of samples into
//! cells, and transforms finished maps into harmonic coefficients.
//! [`HealpixMapper`] is the provided implementation (RING ordering,
//! pixel functions from `scorus`).

use std::f64::consts::PI;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use scorus::coordinates::SphCoord;
use scorus::healpix::pix::{ang2pix_ring, pix2ang_ring};
use scorus::healpix::utils::nside2npix;

use crate::error::{Error, Result};
use crate::map::{Alm, Kernel, Metadata, SkyMap};
use crate::sht;

/// Capability set of a pixelization.
pub trait Mapper {
    /// Pixelization kernel identifier recorded in metadata.
    fn kernel(&self) -> Kernel;

    /// Resolution parameter.
    fn nside(&self) -> u32;

    /// Number of cells of the discretized sky.
    fn npix(&self) -> usize;

    /// Harmonic band-limit used by [`Mapper::transform`].
    fn lmax(&self) -> u32;

    /// Solid angle per cell.
    fn area(&self) -> f64;

    /// Whether the pixel window should later be divided out of
    /// spectra derived from maps made with this mapper.
    fn deconvolve(&self) -> bool;

    /// Metadata template for a map of the given spin.
    fn metadata(&self, spin: i32) -> Metadata;

    /// Zero-initialized, annotated map with `ncomp` components.
    fn create(&self, ncomp: usize, spin: i32) -> SkyMap;

    /// Cell indices for angular positions in degrees.
    fn angles_to_pixels(&self, lon: ArrayView1<f64>, lat: ArrayView1<f64>) -> Vec<usize>;

    /// Accumulate one batch of samples into a weight map and,
    /// optionally, a value map sharing its geometry.
    ///
    /// Cell values are kept as weighted running means: for each
    /// sample with weight `w` and value `v` landing in cell `i`, the
    /// cumulative weight is updated first and then
    /// `val_i += (w / W_i) (v - val_i)`, independently per component
    /// with a shared weight accumulator. This keeps cell means
    /// numerically stable across batches of very different weight
    /// magnitudes.
    fn map_values(
        &self,
        lon: ArrayView1<f64>,
        lat: ArrayView1<f64>,
        wht: &mut SkyMap,
        val: Option<&mut SkyMap>,
        values: Option<ArrayView2<f64>>,
        weights: Option<ArrayView1<f64>>,
    );

    /// Forward harmonic transform honoring the map's spin.
    ///
    /// Returns one coefficient set for spin-0 maps and the E/B pair
    /// (tagged with their name suffixes) for spin-2 maps; any other
    /// spin is unsupported.
    fn transform(&self, map: &SkyMap) -> Result<Vec<(Option<&'static str>, Alm)>>;
}

/// HEALPix mapper in RING ordering.
#[derive(Clone, Debug)]
pub struct HealpixMapper {
    nside: u32,
    lmax: u32,
    deconv: bool,
}

impl HealpixMapper {
    /// Create a mapper with the default band-limit `3·nside - 1`.
    pub fn new(nside: u32) -> Self {
        assert!(nside > 0, "nside must be positive");
        Self {
            nside,
            lmax: 3 * nside - 1,
            deconv: true,
        }
    }

    pub fn with_lmax(mut self, lmax: u32) -> Self {
        self.lmax = lmax;
        self
    }

    pub fn with_deconvolve(mut self, deconv: bool) -> Self {
        self.deconv = deconv;
        self
    }

    /// Change the resolution of a map.
    ///
    /// Degrading averages the child cells of each coarse cell;
    /// upgrading replicates the parent value. Both preserve the sky
    /// mean.
    pub fn ud_grade(&self, map: &SkyMap, nside_out: u32) -> SkyMap {
        let nside_in = map.meta().nside;
        if nside_in == nside_out {
            return map.clone();
        }

        let npix_in = nside2npix(nside_in as usize);
        let npix_out = nside2npix(nside_out as usize);
        let ncomp = map.ncomp();
        let mut out = Array2::<f64>::zeros((ncomp, npix_out));

        if nside_out < nside_in {
            let mut counts = vec![0u32; npix_out];
            for p in 0..npix_in {
                let ang = pix2ang_ring::<f64>(nside_in as usize, p);
                let q = ang2pix_ring(nside_out as usize, ang);
                counts[q] += 1;
                for c in 0..ncomp {
                    out[[c, q]] += map.values()[[c, p]];
                }
            }
            for q in 0..npix_out {
                if counts[q] > 0 {
                    for c in 0..ncomp {
                        out[[c, q]] /= counts[q] as f64;
                    }
                }
            }
        } else {
            for q in 0..npix_out {
                let ang = pix2ang_ring::<f64>(nside_out as usize, q);
                let p = ang2pix_ring(nside_in as usize, ang);
                for c in 0..ncomp {
                    out[[c, q]] = map.values()[[c, p]];
                }
            }
        }

        let mut meta = map.meta().clone();
        meta.nside = nside_out;
        SkyMap::new(out, meta)
    }

    /// Analytic pixel-response function out to `lmax`.
    ///
    /// The scalar variant treats each cell as an equal-area disc of
    /// solid angle `4π/npix`, giving the top-hat window
    /// `w_l = (P_{l-1}(x) - P_{l+1}(x)) / ((2l+1)(1-x))` with
    /// `x = cos θ_c`. The polarization variant (any nonzero spin)
    /// carries the beam-style correction `exp(θ_c²/2)` for `l ≥ 2`.
    pub fn pixel_window(&self, lmax: u32, spin: i32) -> Array1<f64> {
        let npix = self.npix() as f64;
        let x = 1.0 - 2.0 / npix;
        let n = lmax as usize + 1;

        // Legendre values P_0 .. P_{lmax+1} at the disc edge
        let mut p = Vec::with_capacity(n + 1);
        p.push(1.0);
        p.push(x);
        for l in 1..=lmax as usize {
            let lf = l as f64;
            p.push(((2.0 * lf + 1.0) * x * p[l] - lf * p[l - 1]) / (lf + 1.0));
        }

        let mut w = Array1::<f64>::zeros(n);
        w[0] = 1.0;
        for l in 1..n {
            let lf = l as f64;
            w[l] = (p[l - 1] - p[l + 1]) / ((2.0 * lf + 1.0) * (1.0 - x));
        }

        if spin != 0 {
            let theta_c = x.acos();
            let correction = (theta_c * theta_c / 2.0).exp();
            for l in 0..n {
                if l >= 2 {
                    w[l] *= correction;
                } else {
                    w[l] = 1.0;
                }
            }
        }
        w
    }
}

impl Mapper for HealpixMapper {
    fn kernel(&self) -> Kernel {
        Kernel::Healpix
    }

    fn nside(&self) -> u32 {
        self.nside
    }

    fn npix(&self) -> usize {
        nside2npix(self.nside as usize)
    }

    fn lmax(&self) -> u32 {
        self.lmax
    }

    fn area(&self) -> f64 {
        4.0 * PI / self.npix() as f64
    }

    fn deconvolve(&self) -> bool {
        self.deconv
    }

    fn metadata(&self, spin: i32) -> Metadata {
        let mut meta = Metadata::new(Kernel::Healpix, self.nside, spin);
        meta.lmax = Some(self.lmax);
        meta.deconv = self.deconv;
        meta
    }

    fn create(&self, ncomp: usize, spin: i32) -> SkyMap {
        SkyMap::zeros(ncomp, self.npix(), self.metadata(spin))
    }

    fn angles_to_pixels(&self, lon: ArrayView1<f64>, lat: ArrayView1<f64>) -> Vec<usize> {
        assert_eq!(lon.len(), lat.len(), "lon and lat must have equal length");
        let nside = self.nside as usize;
        lon.iter()
            .zip(lat.iter())
            .map(|(&lon, &lat)| {
                let theta = (90.0 - lat).to_radians();
                let phi = lon.to_radians();
                ang2pix_ring(nside, SphCoord::new(theta, phi))
            })
            .collect()
    }

    fn map_values(
        &self,
        lon: ArrayView1<f64>,
        lat: ArrayView1<f64>,
        wht: &mut SkyMap,
        val: Option<&mut SkyMap>,
        values: Option<ArrayView2<f64>>,
        weights: Option<ArrayView1<f64>>,
    ) {
        let n = lon.len();
        assert_eq!(wht.npix(), self.npix(), "weight map geometry mismatch");

        // the accumulation loop wants contiguous inputs
        let lon = lon.as_standard_layout();
        let lat = lat.as_standard_layout();
        let weights = weights.as_ref().map(|w| {
            assert_eq!(w.len(), n, "weights length mismatch");
            w.as_standard_layout()
        });
        let values = values.as_ref().map(|v| {
            assert_eq!(v.ncols(), n, "values length mismatch");
            v.as_standard_layout()
        });

        let ipix = self.angles_to_pixels(lon.view(), lat.view());

        match (val, values) {
            (Some(val), Some(values)) => {
                assert_eq!(val.npix(), self.npix(), "value map geometry mismatch");
                assert_eq!(
                    values.nrows(),
                    val.ncomp(),
                    "values component count mismatch"
                );
                let ncomp = val.ncomp();
                let mut wht = wht.values_mut();
                let mut val = val.values_mut();
                for (r, &i) in ipix.iter().enumerate() {
                    let w = weights.as_ref().map_or(1.0, |ws| ws[r]);
                    let wsum = wht[[0, i]] + w;
                    wht[[0, i]] = wsum;
                    for c in 0..ncomp {
                        let v = values[[c, r]];
                        val[[c, i]] += w / wsum * (v - val[[c, i]]);
                    }
                }
            }
            (None, None) => {
                let mut wht = wht.values_mut();
                for (r, &i) in ipix.iter().enumerate() {
                    let w = weights.as_ref().map_or(1.0, |ws| ws[r]);
                    wht[[0, i]] += w;
                }
            }
            _ => panic!("value map and values must be given together"),
        }
    }

    fn transform(&self, map: &SkyMap) -> Result<Vec<(Option<&'static str>, Alm)>> {
        let meta = {
            let mut meta = map.meta().clone();
            meta.lmax = Some(self.lmax);
            meta
        };
        match map.meta().spin {
            0 => {
                assert_eq!(map.ncomp(), 1, "spin-0 map must have one component");
                let values = sht::analyze_scalar(self.nside, map.component(0), self.lmax);
                let alm = Alm::from_values(values, meta)?;
                Ok(vec![(None, alm)])
            }
            2 => {
                assert_eq!(map.ncomp(), 2, "spin-2 map must have two components");
                let (e, b) =
                    sht::analyze_spin2(self.nside, map.component(0), map.component(1), self.lmax);
                let alm_e = Alm::from_values(e, meta.clone())?;
                let alm_b = Alm::from_values(b, meta)?;
                Ok(vec![(Some("E"), alm_e), (Some("B"), alm_b)])
            }
            spin => Err(Error::UnsupportedSpin(spin)),
        }
    }
}

/// Reconstruct the mapper a map or coefficient set was made with.
pub fn mapper_for(meta: &Metadata, lmax: Option<u32>) -> HealpixMapper {
    let Kernel::Healpix = meta.kernel;
    let mapper = HealpixMapper::new(meta.nside).with_deconvolve(meta.deconv);
    match lmax.or(meta.lmax) {
        Some(lmax) => mapper.with_lmax(lmax),
        None => mapper,
    }
}
