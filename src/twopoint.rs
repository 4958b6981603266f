//! Angular power spectrum estimation.
//!
//! Raw spectra are computed directly from coefficient arrays,
//! additive noise bias is removed with optional pixel-window
//! deconvolution, and spectra (or any per-mode data with trailing
//! dimensions) can be binned over angular modes.

use std::collections::HashSet;
use std::str::FromStr;

use ndarray::{Array1, ArrayD, ArrayView1, ArrayViewD};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::map::{Alm, Kernel, Metadata};
use crate::mapper::mapper_for;
use crate::progress::Progress;
use crate::toc::{toc_match, ClKey, ClPattern, MapKey, Toc};

/// Per-mode weighting scheme for binning.
#[derive(Clone, Debug, Default)]
pub enum ClWeights {
    /// Every mode weighs the same.
    #[default]
    Uniform,
    /// `l (l + 1)` weights.
    EllTimesEllPlusOne,
    /// `2 l + 1` weights, the number of azimuthal modes.
    TwoEllPlusOne,
    /// Explicit per-mode weights, truncated to the data length.
    Explicit(Array1<f64>),
}

impl ClWeights {
    /// Weight per mode for a spectrum of `n` modes.
    pub fn values(&self, n: usize) -> Result<Array1<f64>> {
        match self {
            ClWeights::Uniform => Ok(Array1::ones(n)),
            ClWeights::EllTimesEllPlusOne => {
                Ok(Array1::from_iter((0..n).map(|l| (l * (l + 1)) as f64)))
            }
            ClWeights::TwoEllPlusOne => Ok(Array1::from_iter((0..n).map(|l| (2 * l + 1) as f64))),
            ClWeights::Explicit(w) => {
                if w.len() < n {
                    return Err(Error::WeightsLength {
                        got: w.len(),
                        expected: n,
                    });
                }
                Ok(w.slice(ndarray::s![..n]).to_owned())
            }
        }
    }
}

impl FromStr for ClWeights {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uniform" => Ok(ClWeights::Uniform),
            "l(l+1)" => Ok(ClWeights::EllTimesEllPlusOne),
            "2l+1" => Ok(ClWeights::TwoEllPlusOne),
            other => Err(Error::UnknownWeights(other.to_owned())),
        }
    }
}

/// Binned two-point data.
///
/// Trailing dimensions of the input (beyond the mode axis) are
/// preserved in `data`.
#[derive(Clone, Debug)]
pub struct Binned {
    /// Weighted mean mode number per bin.
    pub ell: Array1<f64>,
    /// Weighted mean of the data per bin.
    pub data: ArrayD<f64>,
    /// Lower bin edges.
    pub lmin: Array1<f64>,
    /// Upper bin edges.
    pub lmax: Array1<f64>,
    /// Summed weight per bin.
    pub weight: Array1<f64>,
}

/// Compute binned two-point data over the leading (mode) axis.
///
/// Bins follow `edges[j-1] <= l < edges[j]`; modes outside the edges
/// are dropped. Bins with zero total weight yield zero instead of
/// dividing by zero.
pub fn bin2pt(arr: ArrayViewD<f64>, edges: ArrayView1<f64>, weights: &ClWeights) -> Result<Binned> {
    let m = edges.len();
    if m < 2 || edges.windows(2).into_iter().any(|e| e[1] <= e[0]) {
        return Err(Error::BadBinEdges);
    }
    let nbins = m - 1;
    let n = arr.shape()[0];
    let w = weights.values(n)?;

    let rest: usize = arr.shape()[1..].iter().product();
    let flat = arr
        .as_standard_layout()
        .into_owned()
        .into_shape((n, rest))
        .expect("shape is exact");

    // bin index per mode; nbins marks out-of-range
    let bin_of = |l: usize| -> usize {
        let lf = l as f64;
        if lf < edges[0] || lf >= edges[m - 1] {
            return nbins;
        }
        let mut j = 0;
        while lf >= edges[j + 1] {
            j += 1;
        }
        j
    };

    let mut weight = Array1::<f64>::zeros(nbins);
    let mut ell = Array1::<f64>::zeros(nbins);
    let mut data = ndarray::Array2::<f64>::zeros((nbins, rest));
    for l in 0..n {
        let j = bin_of(l);
        if j == nbins {
            continue;
        }
        weight[j] += w[l];
        ell[j] += w[l] * l as f64;
        for k in 0..rest {
            data[[j, k]] += w[l] * flat[[l, k]];
        }
    }
    for j in 0..nbins {
        if weight[j] != 0.0 {
            ell[j] /= weight[j];
            for k in 0..rest {
                data[[j, k]] /= weight[j];
            }
        }
    }

    let mut shape: Vec<usize> = vec![nbins];
    shape.extend(&arr.shape()[1..]);
    let data = data.into_shape(shape).expect("shape is exact").into_dyn();

    Ok(Binned {
        ell,
        data,
        lmin: edges.slice(ndarray::s![..m - 1]).to_owned(),
        lmax: edges.slice(ndarray::s![1..]).to_owned(),
        weight,
    })
}

/// Compute the cross (or auto) angular power spectrum of two
/// coefficient sets.
///
/// For each mode `l`, averages `Re(a_lm conj(a'_lm))` over all valid
/// `m`, doubling the `m > 0` half-plane contribution. Unequal
/// band-limits are clipped to the smaller; an explicitly requested
/// larger `lmax` zero-pads the result.
pub fn alm2cl(alm1: &Alm, alm2: &Alm, lmax: Option<u32>) -> Array1<f64> {
    let valid = alm1.lmax().min(alm2.lmax());
    let out_lmax = lmax.unwrap_or(valid);
    let mut cl = Array1::<f64>::zeros(out_lmax as usize + 1);
    for l in 0..=out_lmax.min(valid) {
        let mut sum = (alm1.get(l, 0) * alm2.get(l, 0).conj()).re;
        for m in 1..=l {
            sum += 2.0 * (alm1.get(l, m) * alm2.get(l, m).conj()).re;
        }
        cl[l as usize] = sum / (2.0 * l as f64 + 1.0);
    }
    cl
}

/// Metadata of a two-point entry: both sides' map metadata plus the
/// additive bias, which is kept only for auto-pairs.
#[derive(Clone, Debug)]
pub struct SpectrumMeta {
    pub meta_1: Metadata,
    pub meta_2: Metadata,
    pub bias: Option<f64>,
}

/// Raw or binned per-mode payload of a spectrum entry.
#[derive(Clone, Debug)]
pub enum ClData {
    Raw(Array1<f64>),
    Binned(Binned),
}

/// One angular power spectrum with its two-sided metadata.
#[derive(Clone, Debug)]
pub struct Spectrum {
    pub data: ClData,
    pub meta: SpectrumMeta,
}

impl Spectrum {
    /// The per-mode (or per-bin) values of this spectrum.
    pub fn values(&self) -> ArrayView1<f64> {
        match &self.data {
            ClData::Raw(cl) => cl.view(),
            ClData::Binned(binned) => binned
                .data
                .view()
                .into_dimensionality()
                .expect("binned spectra are one-dimensional"),
        }
    }
}

/// Binning request applied in the same pass as spectrum computation.
#[derive(Clone, Debug)]
pub struct Binning {
    pub edges: Array1<f64>,
    pub weights: ClWeights,
}

/// Options for [`angular_power_spectra`].
#[derive(Default)]
pub struct SpectraOptions {
    /// Clip or zero-pad spectra to this mode limit.
    pub lmax: Option<u32>,
    /// Keys must match one of these patterns, if given.
    pub include: Option<Vec<ClPattern>>,
    /// Keys matching any of these patterns are skipped.
    pub exclude: Vec<ClPattern>,
    /// Remove the additive bias in the same pass.
    pub debias: bool,
    /// Bin each spectrum in the same pass.
    pub bins: Option<Binning>,
}

/// Compute angular power spectra for all pairs of coefficient sets.
///
/// Without a second set, all unordered pairs of `alms` are formed;
/// with one, all ordered pairs between the two sets. Pairs already
/// present in the output (in either order) are skipped, and pair
/// names are kept in a consistent standard order across bins.
pub fn angular_power_spectra(
    alms: &Toc<MapKey, Alm>,
    alms2: Option<&Toc<MapKey, Alm>>,
    options: &SpectraOptions,
    mut progress: Option<&mut dyn Progress>,
) -> Result<Toc<ClKey, Spectrum>> {
    info!(
        alms = alms.len(),
        cross = alms2.map_or(0, |a| a.len()),
        "computing angular power spectra"
    );

    let keys1: Vec<MapKey> = alms.keys().cloned().collect();
    let pairs: Vec<(MapKey, MapKey)> = match alms2 {
        None => {
            let mut pairs = Vec::new();
            for (i, a) in keys1.iter().enumerate() {
                for b in &keys1[i..] {
                    pairs.push((a.clone(), b.clone()));
                }
            }
            pairs
        }
        Some(alms2) => {
            let keys2: Vec<MapKey> = alms2.keys().cloned().collect();
            keys1
                .iter()
                .flat_map(|a| keys2.iter().map(move |b| (a.clone(), b.clone())))
                .collect()
        }
    };
    let second = alms2.unwrap_or(alms);

    if let Some(progress) = progress.as_deref_mut() {
        progress.begin("spectra", pairs.len() as u64);
    }

    let mut out: Toc<ClKey, Spectrum> = Toc::new();
    let mut names_seen: HashSet<(String, String)> = HashSet::new();

    for (ka, kb) in pairs {
        if let Some(progress) = progress.as_deref_mut() {
            progress.advance(1);
        }

        let mut key = ClKey::new(&ka.field, &kb.field, ka.bin, kb.bin);

        // skip duplicates in any order
        if out.contains_key(&key) || out.contains_key(&key.swapped()) {
            continue;
        }

        // keep the two-point name in standard order
        let name = (key.field1.clone(), key.field2.clone());
        let swapped_name = (key.field2.clone(), key.field1.clone());
        let swapped = !names_seen.contains(&name) && names_seen.contains(&swapped_name);
        if swapped {
            key = key.swapped();
        }

        if !toc_match(&key, options.include.as_deref(), &options.exclude) {
            continue;
        }

        debug!(
            field1 = key.field1.as_str(),
            field2 = key.field2.as_str(),
            bin1 = key.bin1,
            bin2 = key.bin2,
            "computing cl"
        );

        // respect the swap when fetching the coefficient sets
        let (alm1, alm2) = if swapped {
            (
                second.get(&MapKey::new(&key.field1, key.bin1)),
                alms.get(&MapKey::new(&key.field2, key.bin2)),
            )
        } else {
            (
                alms.get(&MapKey::new(&key.field1, key.bin1)),
                second.get(&MapKey::new(&key.field2, key.bin2)),
            )
        };
        let (alm1, alm2) = (
            alm1.expect("pair keys come from the input"),
            alm2.expect("pair keys come from the input"),
        );

        let mut cl = alm2cl(alm1, alm2, options.lmax);

        let auto = key.field1 == key.field2 && key.bin1 == key.bin2;
        let meta = SpectrumMeta {
            meta_1: alm1.meta().clone(),
            meta_2: alm2.meta().clone(),
            bias: if auto { alm1.meta().bias } else { None },
        };

        if options.debias {
            let bias = meta.bias.unwrap_or(0.0);
            debias_cl(cl.view_mut(), &meta, bias);
        }

        let data = match &options.bins {
            Some(binning) => ClData::Binned(bin2pt(
                cl.view().into_dyn(),
                binning.edges.view(),
                &binning.weights,
            )?),
            None => ClData::Raw(cl),
        };

        names_seen.insert((key.field1.clone(), key.field2.clone()));
        out.insert(key, Spectrum { data, meta });
    }

    if let Some(progress) = progress.as_deref_mut() {
        progress.finish();
    }
    info!(cls = out.len(), "computed angular power spectra");
    Ok(out)
}

/// Subtract a constant additive bias from one spectrum.
///
/// Modes below `max(|spin1|, |spin2|)` are undefined for nonzero spin
/// and left untouched. For each side whose metadata marks the HEALPix
/// kernel with deconvolution enabled, the bias is divided by that
/// side's analytic pixel window (scalar or polarization variant by
/// that side's spin) before subtraction.
fn debias_cl(mut cl: ndarray::ArrayViewMut1<f64>, meta: &SpectrumMeta, bias: f64) {
    let n = cl.len();
    if n == 0 {
        return;
    }
    let lmax = (n - 1) as u32;
    let lmin = meta.meta_1.spin.unsigned_abs().max(meta.meta_2.spin.unsigned_abs()) as usize;

    let mut subtract = Array1::<f64>::from_elem(n, bias);
    for side in [&meta.meta_1, &meta.meta_2] {
        if side.kernel == Kernel::Healpix && side.deconv {
            let window = mapper_for(side, None).pixel_window(lmax, side.spin);
            for l in 0..n {
                subtract[l] /= window[l];
            }
        }
    }

    for l in lmin..n {
        cl[l] -= subtract[l];
    }
}

/// Remove the additive bias from a set of spectra, returning new
/// entries.
///
/// The bias comes from an explicit table if given, falling back to
/// each spectrum's own metadata. Binned entries are left unchanged;
/// debiasing happens before binning.
pub fn debias_cls(
    cls: &Toc<ClKey, Spectrum>,
    bias: Option<&Toc<ClKey, f64>>,
) -> Toc<ClKey, Spectrum> {
    let mut out = Toc::new();
    for (key, spectrum) in cls {
        let mut spectrum = spectrum.clone();
        debias_spectrum(key, &mut spectrum, bias);
        out.insert(key.clone(), spectrum);
    }
    out
}

/// In-place variant of [`debias_cls`].
pub fn debias_cls_inplace(cls: &mut Toc<ClKey, Spectrum>, bias: Option<&Toc<ClKey, f64>>) {
    for (key, spectrum) in cls.iter_mut() {
        debias_spectrum(key, spectrum, bias);
    }
}

fn debias_spectrum(key: &ClKey, spectrum: &mut Spectrum, bias: Option<&Toc<ClKey, f64>>) {
    let b = match bias {
        Some(table) => table.get(key).copied().unwrap_or(0.0),
        None => spectrum.meta.bias.unwrap_or(0.0),
    };
    match &mut spectrum.data {
        ClData::Raw(cl) => {
            debias_cl(cl.view_mut(), &spectrum.meta, b);
            spectrum.meta.bias = Some(b);
        }
        ClData::Binned(_) => {
            tracing::warn!(
                field1 = key.field1.as_str(),
                field2 = key.field2.as_str(),
                "skipping debias of binned spectrum"
            );
        }
    }
}

/// Bin a set of spectra, returning new entries.
pub fn binned_cls(
    cls: &Toc<ClKey, Spectrum>,
    edges: ArrayView1<f64>,
    weights: &ClWeights,
) -> Result<Toc<ClKey, Spectrum>> {
    let mut out = Toc::new();
    for (key, spectrum) in cls {
        let data = match &spectrum.data {
            ClData::Raw(cl) => {
                ClData::Binned(bin2pt(cl.view().into_dyn(), edges, weights)?)
            }
            ClData::Binned(binned) => ClData::Binned(binned.clone()),
        };
        out.insert(
            key.clone(),
            Spectrum {
                data,
                meta: spectrum.meta.clone(),
            },
        );
    }
    Ok(out)
}
