//! Field definitions and per-kind aggregation.
//!
//! A [`Field`] describes how one observable of a catalog turns into
//! an annotated sky map: which columns it reads, its spin weight, and
//! its normalization/randomization behavior. The page-driven work is
//! done by an [`Aggregator`] created per (field, catalog) pair, which
//! the scheduler feeds one page at a time and then finalizes.

use std::cell::RefCell;
use std::rc::Rc;

use ndarray::{stack, Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Binomial, Distribution};
use tracing::warn;

use crate::catalog::{Catalog, CatalogPage};
use crate::error::{Error, Result};
use crate::map::SkyMap;
use crate::mapper::{HealpixMapper, Mapper};

/// Shared handle to an injected random source.
pub type RngHandle = Rc<RefCell<StdRng>>;

/// Wrap a seeded random source for injection into fields.
pub fn rng_handle(rng: StdRng) -> RngHandle {
    Rc::new(RefCell::new(rng))
}

/// Aggregation strategy selected by a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// Per-cell object counts, or overdensity.
    Positions,
    /// Weighted mean of one real value column per cell.
    Scalar,
    /// Weighted mean of a two-component value per cell.
    Complex,
    /// Copy of the catalog visibility map.
    Visibility,
    /// The weight column itself accumulated per cell.
    Weights,
}

/// Catalog columns read by a field.
#[derive(Clone, Debug, Default)]
struct Columns {
    lon: Option<String>,
    lat: Option<String>,
    values: Vec<String>,
    weight: Option<String>,
}

/// One observable of a catalog and how to map it.
#[derive(Clone, Debug)]
pub struct Field {
    kind: FieldKind,
    mapper: HealpixMapper,
    columns: Columns,
    spin: i32,
    mask: Option<String>,
    normalize: bool,
    overdensity: bool,
    randomize: bool,
    nbar: Option<f64>,
    rng: Option<RngHandle>,
}

impl Field {
    /// Generic constructor from a column name slice; the expected
    /// count depends on the field kind.
    pub fn new(kind: FieldKind, mapper: HealpixMapper, columns: &[&str]) -> Result<Self> {
        let cols = match (kind, columns) {
            (FieldKind::Positions, [lon, lat]) => Columns {
                lon: Some((*lon).into()),
                lat: Some((*lat).into()),
                ..Columns::default()
            },
            (FieldKind::Scalar, [lon, lat, value, rest @ ..]) if rest.len() <= 1 => Columns {
                lon: Some((*lon).into()),
                lat: Some((*lat).into()),
                values: vec![(*value).into()],
                weight: rest.first().map(|w| (*w).into()),
            },
            (FieldKind::Complex, [lon, lat, re, im, rest @ ..]) if rest.len() <= 1 => Columns {
                lon: Some((*lon).into()),
                lat: Some((*lat).into()),
                values: vec![(*re).into(), (*im).into()],
                weight: rest.first().map(|w| (*w).into()),
            },
            (FieldKind::Visibility, []) => Columns::default(),
            (FieldKind::Weights, [lon, lat, weight]) => Columns {
                lon: Some((*lon).into()),
                lat: Some((*lat).into()),
                weight: Some((*weight).into()),
                ..Columns::default()
            },
            _ => {
                return Err(Error::ColumnCount {
                    expected: match kind {
                        FieldKind::Positions => "2 (lon, lat)",
                        FieldKind::Scalar => "3-4 (lon, lat, value[, weight])",
                        FieldKind::Complex => "4-5 (lon, lat, re, im[, weight])",
                        FieldKind::Visibility => "0",
                        FieldKind::Weights => "3 (lon, lat, weight)",
                    },
                    got: columns.len(),
                })
            }
        };
        Ok(Self {
            kind,
            mapper,
            columns: cols,
            spin: 0,
            mask: None,
            normalize: true,
            overdensity: kind == FieldKind::Positions,
            randomize: false,
            nbar: None,
            rng: None,
        })
    }

    /// Position field accumulating counts (or overdensity) per cell.
    pub fn positions(mapper: HealpixMapper, lon: &str, lat: &str) -> Self {
        Self::new(FieldKind::Positions, mapper, &[lon, lat]).expect("column count is exact")
    }

    /// Scalar field with an optional weight column.
    pub fn scalar(
        mapper: HealpixMapper,
        lon: &str,
        lat: &str,
        value: &str,
        weight: Option<&str>,
    ) -> Self {
        let mut columns = vec![lon, lat, value];
        columns.extend(weight);
        Self::new(FieldKind::Scalar, mapper, &columns).expect("column count is exact")
    }

    /// Two-component field with the given spin weight.
    pub fn complex(
        mapper: HealpixMapper,
        lon: &str,
        lat: &str,
        re: &str,
        im: &str,
        weight: Option<&str>,
        spin: i32,
    ) -> Self {
        let mut columns = vec![lon, lat, re, im];
        columns.extend(weight);
        let mut field =
            Self::new(FieldKind::Complex, mapper, &columns).expect("column count is exact");
        field.spin = spin;
        field
    }

    /// Spin-2 field, the usual shear/ellipticity case.
    pub fn spin2(
        mapper: HealpixMapper,
        lon: &str,
        lat: &str,
        re: &str,
        im: &str,
        weight: Option<&str>,
    ) -> Self {
        Self::complex(mapper, lon, lat, re, im, weight, 2)
    }

    /// Copy of the catalog visibility at the mapper resolution.
    pub fn visibility(mapper: HealpixMapper) -> Self {
        Self::new(FieldKind::Visibility, mapper, &[]).expect("column count is exact")
    }

    /// Weight map of the catalog.
    pub fn weights(mapper: HealpixMapper, lon: &str, lat: &str, weight: &str) -> Self {
        Self::new(FieldKind::Weights, mapper, &[lon, lat, weight]).expect("column count is exact")
    }

    /// Mask name used to group this field for mixing matrices.
    pub fn with_mask(mut self, mask: &str) -> Self {
        self.mask = Some(mask.into());
        self
    }

    /// Disable (or enable) normalization by the mean weight; for
    /// position fields this is the overdensity flag.
    pub fn with_normalize(mut self, normalize: bool) -> Self {
        self.normalize = normalize;
        if self.kind == FieldKind::Positions {
            self.overdensity = normalize;
        }
        self
    }

    /// Produce overdensity instead of raw counts (positions only).
    pub fn with_overdensity(mut self, overdensity: bool) -> Self {
        self.overdensity = overdensity;
        self.normalize = overdensity;
        self
    }

    /// Randomize the map using the injected random source.
    pub fn with_randomize(mut self, randomize: bool) -> Self {
        self.randomize = randomize;
        self
    }

    /// Inject the random source used by randomized fields.
    pub fn with_rng(mut self, rng: RngHandle) -> Self {
        self.rng = Some(rng);
        self
    }

    /// Override the mean density estimated from the data.
    pub fn with_nbar(mut self, nbar: f64) -> Self {
        self.nbar = Some(nbar);
        self
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn spin(&self) -> i32 {
        self.spin
    }

    pub fn mask(&self) -> Option<&str> {
        self.mask.as_deref()
    }

    pub fn mapper(&self) -> &HealpixMapper {
        &self.mapper
    }

    /// Start an aggregation of this field over one catalog.
    pub fn begin<'a>(&self, catalog: &'a dyn Catalog) -> Result<Box<dyn Aggregator + 'a>> {
        if self.randomize && self.rng.is_none() {
            return Err(Error::NoRandomSource);
        }
        Ok(match self.kind {
            FieldKind::Positions => Box::new(PositionsAggregator {
                field: self.clone(),
                catalog,
                pos: self.mapper.create(1, 0),
                ngal: 0,
            }),
            FieldKind::Scalar | FieldKind::Complex => {
                let ncomp = self.columns.values.len();
                Box::new(ValuesAggregator {
                    field: self.clone(),
                    catalog,
                    wht: self.mapper.create(1, 0),
                    val: self.mapper.create(ncomp, self.spin),
                    ngal: 0,
                    wmean: 0.0,
                    var: 0.0,
                })
            }
            FieldKind::Visibility => Box::new(VisibilityAggregator {
                field: self.clone(),
                catalog,
            }),
            FieldKind::Weights => Box::new(WeightsAggregator {
                field: self.clone(),
                catalog,
                wht: self.mapper.create(1, 0),
            }),
        })
    }

    /// Drive one aggregation start-to-finish over a single catalog.
    pub fn map_catalog(&self, catalog: &dyn Catalog) -> Result<SkyMap> {
        let mut agg = self.begin(catalog)?;
        if agg.wants_pages() {
            for page in catalog.pages() {
                agg.push(&page?)?;
            }
        }
        agg.finish()
    }
}

/// Page-driven accumulation state of one (field, catalog) pair.
///
/// The scheduler calls [`Aggregator::push`] once per catalog page and
/// [`Aggregator::finish`] after the page stream ends.
pub trait Aggregator {
    /// Whether this aggregation consumes catalog pages at all.
    fn wants_pages(&self) -> bool {
        true
    }

    /// Consume one page of catalog rows.
    fn push(&mut self, page: &CatalogPage) -> Result<()>;

    /// Finalize and return the annotated map.
    fn finish(self: Box<Self>) -> Result<SkyMap>;
}

/// Fetch the catalog visibility at the mapper resolution, warning on
/// a resolution change.
fn visibility_at(
    catalog: &dyn Catalog,
    mapper: &HealpixMapper,
    context: &str,
) -> Option<SkyMap> {
    let vmap = catalog.visibility()?;
    if vmap.meta().nside != mapper.nside() {
        warn!(
            vmap_nside = vmap.meta().nside,
            nside = mapper.nside(),
            "changing resolution of visibility map for {context}"
        );
        Some(mapper.ud_grade(vmap, mapper.nside()))
    } else {
        Some(vmap.clone())
    }
}

/// Mean of the catalog visibility, 1 for a full-sky catalog.
fn mean_visibility(catalog: &dyn Catalog) -> f64 {
    catalog.visibility().map_or(1.0, |v| v.mean())
}

/// Redistribute `n` draws over cells with the given (unnormalized)
/// probability weights, by sequential conditional binomial sampling.
/// The draws always sum to `n`.
fn multinomial(rng: &mut StdRng, n: u64, p: &[f64]) -> Vec<u64> {
    let mut out = vec![0u64; p.len()];
    let mut remaining = n;
    let mut rest: f64 = p.iter().sum();
    for (i, &pi) in p.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        if i + 1 == p.len() || rest <= pi {
            out[i] = remaining;
            break;
        }
        let q = (pi / rest).clamp(0.0, 1.0);
        let draw = match Binomial::new(remaining, q) {
            Ok(d) => d.sample(rng),
            Err(_) => 0,
        };
        out[i] = draw;
        remaining -= draw;
        rest -= pi;
    }
    out
}

struct PositionsAggregator<'a> {
    field: Field,
    catalog: &'a dyn Catalog,
    pos: SkyMap,
    ngal: u64,
}

impl Aggregator for PositionsAggregator<'_> {
    fn push(&mut self, page: &CatalogPage) -> Result<()> {
        if !self.field.randomize {
            let cols = &self.field.columns;
            let lon = page.get(cols.lon.as_deref().expect("positions have lon"))?;
            let lat = page.get(cols.lat.as_deref().expect("positions have lat"))?;
            self.field
                .mapper
                .map_values(lon.view(), lat.view(), &mut self.pos, None, None, None);
        }
        self.ngal += page.size() as u64;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<SkyMap> {
        let Self {
            field,
            catalog,
            mut pos,
            ngal,
        } = *self;
        let mapper = &field.mapper;
        let npix = mapper.npix() as f64;

        let vmap = visibility_at(catalog, mapper, "position map");

        if field.randomize {
            let handle = field.rng.as_ref().ok_or(Error::NoRandomSource)?;
            let p: Vec<f64> = match &vmap {
                Some(v) => v.component(0).to_vec(),
                None => vec![1.0 / npix; npix as usize],
            };
            let counts = multinomial(&mut handle.borrow_mut(), ngal, &p);
            for (cell, &count) in counts.iter().enumerate() {
                pos.values_mut()[[0, cell]] = count as f64;
            }
        }

        let vbar = vmap.as_ref().map_or(1.0, |v| v.mean());

        // mean density from the data, overridable within tolerance
        let mut nbar = ngal as f64 / vbar / npix;
        if let Some(nbar_given) = field.nbar {
            let sigma_nbar = (nbar / vbar / npix).sqrt();
            if (nbar - nbar_given).abs() > 3.0 * sigma_nbar {
                warn!(
                    provided = nbar_given,
                    estimated = nbar,
                    "provided mean density differs from the estimated mean density by more than 3 sigma"
                );
            }
            nbar = nbar_given;
        }

        // shot-noise bias of the counts
        let area = mapper.area();
        let mut bias = ngal as f64 / (4.0 * std::f64::consts::PI) * area * area;

        if field.overdensity {
            match &vmap {
                Some(v) => {
                    let vis = v.component(0).to_owned();
                    let mut row = pos.component_mut(0);
                    row /= nbar;
                    row -= &vis;
                }
                None => {
                    let mut row = pos.component_mut(0);
                    row /= nbar;
                    row -= 1.0;
                }
            }
            bias /= nbar * nbar;
        }

        let meta = pos.meta_mut();
        meta.power = if field.overdensity { 0 } else { 1 };
        meta.nbar = Some(nbar);
        meta.bias = Some(bias);
        meta.catalog = Some(catalog.label().to_owned());
        Ok(pos)
    }
}

/// Shared aggregation for scalar and complex value fields; the only
/// differences are the component count and the bias prefactor.
struct ValuesAggregator<'a> {
    field: Field,
    catalog: &'a dyn Catalog,
    wht: SkyMap,
    val: SkyMap,
    ngal: u64,
    wmean: f64,
    var: f64,
}

impl Aggregator for ValuesAggregator<'_> {
    fn push(&mut self, page: &CatalogPage) -> Result<()> {
        let cols = &self.field.columns;

        // drop zero-weight rows before accumulation
        let trimmed;
        let page = match &cols.weight {
            Some(wcol) => {
                let w = page.col(wcol)?;
                let remove: Vec<bool> = w.iter().map(|&x| x == 0.0).collect();
                trimmed = page.delete(&remove)?;
                &trimmed
            }
            None => page,
        };
        if page.size() == 0 {
            return Ok(());
        }

        let lon = page.get(cols.lon.as_deref().expect("value fields have lon"))?;
        let lat = page.get(cols.lat.as_deref().expect("value fields have lat"))?;
        let mut components: Vec<Array1<f64>> = Vec::with_capacity(cols.values.len());
        for name in &cols.values {
            components.push(page.get(name)?.clone());
        }
        let weights = match &cols.weight {
            Some(wcol) => page.get(wcol)?.clone(),
            None => Array1::ones(page.size()),
        };

        if self.field.randomize {
            let handle = self.field.rng.as_ref().ok_or(Error::NoRandomSource)?;
            let mut rng = handle.borrow_mut();
            assert_eq!(components.len(), 2, "only complex fields randomize");
            for r in 0..page.size() {
                let angle = rng.gen::<f64>() * std::f64::consts::TAU;
                let radius = components[0][r].hypot(components[1][r]);
                components[0][r] = radius * angle.cos();
                components[1][r] = radius * angle.sin();
            }
        }

        let views: Vec<_> = components.iter().map(|c| c.view()).collect();
        let values: Array2<f64> = stack(Axis(0), &views).expect("equal column lengths");
        self.field.mapper.map_values(
            lon.view(),
            lat.view(),
            &mut self.wht,
            Some(&mut self.val),
            Some(values.view()),
            Some(weights.view()),
        );

        // one-pass running statistics across pages
        self.ngal += page.size() as u64;
        let n = self.ngal as f64;
        let wmean = self.wmean;
        self.wmean += weights.iter().map(|w| w - wmean).sum::<f64>() / n;
        let var = self.var;
        let wv_sq = |r: usize| -> f64 {
            components
                .iter()
                .map(|c| (weights[r] * c[r]).powi(2))
                .sum::<f64>()
        };
        self.var += (0..page.size()).map(|r| wv_sq(r) - var).sum::<f64>() / n;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<SkyMap> {
        let Self {
            field,
            catalog,
            mut wht,
            mut val,
            ngal,
            wmean,
            var,
        } = *self;
        let mapper = &field.mapper;
        let npix = mapper.npix() as f64;
        let vbar = mean_visibility(catalog);
        let ngal_f = ngal as f64;

        // mean weight per visible cell
        let wbar = ngal_f / npix / vbar * wmean;

        // the full-circle prefactor halves for two-component fields
        let circle = match field.kind {
            FieldKind::Complex => 2.0 * std::f64::consts::PI,
            _ => 4.0 * std::f64::consts::PI,
        };
        let bias = if field.normalize {
            wht.values_mut().mapv_inplace(|w| w / wbar);
            circle * vbar * vbar / ngal_f * (var / (wmean * wmean))
        } else {
            (circle / npix) * (ngal_f / npix) * var
        };

        // cell values were kept as means for numerical stability;
        // turn them into (normalized) sums now
        let weight_row = wht.component(0).to_owned();
        for c in 0..val.ncomp() {
            let mut row = val.component_mut(c);
            row *= &weight_row;
        }

        let meta = val.meta_mut();
        meta.power = if field.normalize { 0 } else { 1 };
        meta.wbar = Some(wbar);
        meta.bias = Some(bias);
        meta.catalog = Some(catalog.label().to_owned());
        Ok(val)
    }
}

struct VisibilityAggregator<'a> {
    field: Field,
    catalog: &'a dyn Catalog,
}

impl Aggregator for VisibilityAggregator<'_> {
    fn wants_pages(&self) -> bool {
        false
    }

    fn push(&mut self, _page: &CatalogPage) -> Result<()> {
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<SkyMap> {
        let Self { field, catalog } = *self;
        let mapper = &field.mapper;
        let mut out = visibility_at(catalog, mapper, "visibility field")
            .ok_or_else(|| Error::NoVisibility(catalog.label().to_owned()))?;

        let meta = out.meta_mut();
        let template = mapper.metadata(0);
        meta.kernel = template.kernel;
        meta.lmax = template.lmax;
        meta.deconv = template.deconv;
        meta.spin = 0;
        meta.power = 0;
        meta.catalog = Some(catalog.label().to_owned());
        Ok(out)
    }
}

struct WeightsAggregator<'a> {
    field: Field,
    catalog: &'a dyn Catalog,
    wht: SkyMap,
}

impl Aggregator for WeightsAggregator<'_> {
    fn push(&mut self, page: &CatalogPage) -> Result<()> {
        let cols = &self.field.columns;
        let lon = page.get(cols.lon.as_deref().expect("weight fields have lon"))?;
        let lat = page.get(cols.lat.as_deref().expect("weight fields have lat"))?;
        let weights = match &cols.weight {
            Some(wcol) => page.get(wcol)?.clone(),
            None => Array1::ones(page.size()),
        };
        self.field.mapper.map_values(
            lon.view(),
            lat.view(),
            &mut self.wht,
            None,
            None,
            Some(weights.view()),
        );
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<SkyMap> {
        let Self {
            field,
            catalog,
            mut wht,
        } = *self;
        let wbar = wht.mean() / mean_visibility(catalog);

        if field.normalize {
            wht.values_mut().mapv_inplace(|w| w / wbar);
        }

        let meta = wht.meta_mut();
        meta.power = if field.normalize { 0 } else { 1 };
        meta.wbar = Some(wbar);
        meta.catalog = Some(catalog.label().to_owned());
        Ok(wht)
    }
}
