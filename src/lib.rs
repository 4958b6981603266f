//! Catalog-to-map accumulation and angular power spectra on the sphere.
//!
//! This crate converts large tabular astronomical catalogs into
//! pixelized sky maps, spherical-harmonic coefficients, and debiased,
//! binned two-point angular power spectra. Catalogs are processed in
//! pages so they never need to fit in memory, and any number of
//! (field, catalog) combinations can be driven through one pass over
//! the data.
//!
//! The pipeline runs in stages, each producing a keyed [`toc::Toc`]
//! collection:
//!
//! 1. [`mapping::map_catalogs`] — fields aggregate catalog pages
//!    into annotated maps;
//! 2. [`mapping::transform_maps`] — maps become harmonic
//!    coefficients, spin-2 fields splitting into E/B;
//! 3. [`twopoint::angular_power_spectra`] — coefficient pairs become
//!    debiased, optionally binned spectra;
//! 4. [`mixing::mixing_matrices`] — mask spectra become mode-coupling
//!    matrices for the masked-sky correction.

pub mod catalog;
pub mod error;
pub mod fields;
pub mod map;
pub mod mapper;
pub mod mapping;
pub mod mixing;
pub mod progress;
mod sht;
pub mod toc;
pub mod twopoint;
mod wigner;

// Re-exports for easier access
pub use catalog::{ArrayCatalog, Catalog, CatalogPage};
pub use error::{Error, Result};
pub use fields::{rng_handle, Field, FieldKind};
pub use map::{Alm, Kernel, Metadata, SkyMap};
pub use mapper::{HealpixMapper, Mapper};
pub use mapping::{map_catalogs, transform_maps, MapOptions};
pub use mixing::{binned_mms, mixing_matrices, ConvolveKernel, MixingOptions, WignerKernel};
pub use progress::Progress;
pub use toc::{ClKey, ClPattern, MapKey, MapPattern, Toc};
pub use twopoint::{
    alm2cl, angular_power_spectra, binned_cls, debias_cls, debias_cls_inplace, bin2pt, Binned,
    Binning, ClWeights, SpectraOptions, Spectrum, SpectrumMeta,
};
