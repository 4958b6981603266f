//! Sky map and harmonic coefficient containers.
//!
//! Every pixelized map and every coefficient set travels together
//! with an explicit [`Metadata`] record, so later pipeline stages
//! (transforms, debiasing, mode-coupling) need no side information
//! beyond the payload itself.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, ArrayViewMut1, ArrayViewMut2};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Pixelization kernel of a map.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kernel {
    /// HEALPix equal-area pixelization, RING ordering.
    Healpix,
}

/// Metadata attached to every map and coefficient set.
///
/// The fields mirror what the persistence collaborator reads and
/// writes at the crate boundary: `kernel`, `nside`, `spin`, `lmax`,
/// `deconv`, `power`, `bias`, `nbar`/`wbar`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Pixelization kernel the payload was accumulated on.
    pub kernel: Kernel,
    /// Resolution parameter of the pixelization.
    pub nside: u32,
    /// Spin weight of the field (0 scalar, 2 polarization-like).
    pub spin: i32,
    /// Harmonic band-limit, if one has been chosen.
    pub lmax: Option<u32>,
    /// Whether the pixel window should be divided out of spectra
    /// derived from this payload.
    pub deconv: bool,
    /// Power of the cell area with which derived spectra scale.
    pub power: i32,
    /// Additive noise bias estimate for derived spectra.
    pub bias: Option<f64>,
    /// Mean object density (position-type fields).
    pub nbar: Option<f64>,
    /// Mean weight per visible cell (value-type fields).
    pub wbar: Option<f64>,
    /// Label of the catalog the payload was accumulated from.
    pub catalog: Option<String>,
}

impl Metadata {
    pub fn new(kernel: Kernel, nside: u32, spin: i32) -> Self {
        Self {
            kernel,
            nside,
            spin,
            lmax: None,
            deconv: true,
            power: 0,
            bias: None,
            nbar: None,
            wbar: None,
            catalog: None,
        }
    }
}

/// A pixelized sky map: `ncomp x npix` values plus metadata.
///
/// Scalar fields have one component; complex (spin-weighted) fields
/// store their real and imaginary parts as two components sharing the
/// pixel axis.
#[derive(Clone, Debug)]
pub struct SkyMap {
    values: Array2<f64>,
    meta: Metadata,
}

impl SkyMap {
    pub fn new(values: Array2<f64>, meta: Metadata) -> Self {
        Self { values, meta }
    }

    /// Zero-initialized map with the given shape and metadata.
    pub fn zeros(ncomp: usize, npix: usize, meta: Metadata) -> Self {
        Self {
            values: Array2::zeros((ncomp, npix)),
            meta,
        }
    }

    /// Single-component map from a flat pixel array.
    pub fn from_component(values: Array1<f64>, meta: Metadata) -> Self {
        let npix = values.len();
        Self {
            values: values.into_shape((1, npix)).expect("shape is exact"),
            meta,
        }
    }

    pub fn ncomp(&self) -> usize {
        self.values.nrows()
    }

    pub fn npix(&self) -> usize {
        self.values.ncols()
    }

    pub fn values(&self) -> ArrayView2<f64> {
        self.values.view()
    }

    pub fn values_mut(&mut self) -> ArrayViewMut2<f64> {
        self.values.view_mut()
    }

    pub fn component(&self, i: usize) -> ArrayView1<f64> {
        self.values.row(i)
    }

    pub fn component_mut(&mut self, i: usize) -> ArrayViewMut1<f64> {
        self.values.row_mut(i)
    }

    /// Mean of the first component over all cells.
    pub fn mean(&self) -> f64 {
        self.values.row(0).mean().unwrap_or(0.0)
    }

    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut Metadata {
        &mut self.meta
    }
}

/// Number of coefficients stored for a band-limit `lmax`.
pub fn alm_size(lmax: u32) -> usize {
    let n = lmax as usize + 1;
    n * (n + 1) / 2
}

/// Band-limit corresponding to a coefficient array length, if any.
pub fn alm_lmax(len: usize) -> Option<u32> {
    let mut lmax = (((8 * len + 1) as f64).sqrt() as usize).saturating_sub(3) / 2;
    while alm_size(lmax as u32) < len {
        lmax += 1;
    }
    (alm_size(lmax as u32) == len).then(|| lmax as u32)
}

/// Spherical-harmonic coefficients of one field component.
///
/// Coefficients are stored for `m >= 0` only (the negative-m half
/// plane is implied by the reality of the underlying field), ordered
/// m-major: all `l` of `m = 0`, then all `l >= 1` of `m = 1`, and so
/// on. [`Alm::index`] maps `(l, m)` to the flat position.
#[derive(Clone, Debug)]
pub struct Alm {
    values: Array1<Complex64>,
    lmax: u32,
    meta: Metadata,
}

impl Alm {
    /// Zero-initialized coefficient set for the given band-limit.
    pub fn zeros(lmax: u32, meta: Metadata) -> Self {
        Self {
            values: Array1::zeros(alm_size(lmax)),
            lmax,
            meta,
        }
    }

    /// Wrap an existing coefficient array, deriving the band-limit
    /// from its (necessarily triangular) length.
    pub fn from_values(values: Array1<Complex64>, meta: Metadata) -> Result<Self> {
        let lmax = alm_lmax(values.len()).ok_or(Error::BadAlmSize(values.len()))?;
        Ok(Self { values, lmax, meta })
    }

    /// Flat index of the `(l, m)` coefficient in the m-major layout.
    pub fn index(lmax: u32, l: u32, m: u32) -> usize {
        debug_assert!(m <= l && l <= lmax);
        let (lmax, l, m) = (lmax as usize, l as usize, m as usize);
        m * (2 * lmax + 1 - m) / 2 + l
    }

    pub fn lmax(&self) -> u32 {
        self.lmax
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, l: u32, m: u32) -> Complex64 {
        self.values[Self::index(self.lmax, l, m)]
    }

    pub fn set(&mut self, l: u32, m: u32, value: Complex64) {
        self.values[Self::index(self.lmax, l, m)] = value;
    }

    pub fn values(&self) -> ArrayView1<Complex64> {
        self.values.view()
    }

    pub fn values_mut(&mut self) -> ArrayViewMut1<Complex64> {
        self.values.view_mut()
    }

    pub fn meta(&self) -> &Metadata {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut Metadata {
        &mut self.meta
    }
}
