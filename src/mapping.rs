//! Catalog-to-map scheduling and map-to-alm transforms.
//!
//! [`map_catalogs`] drives a set of fields over a set of catalogs.
//! Catalogs of identical total size and page size can be grouped so
//! their page streams are read in lockstep, and every (field,
//! catalog) aggregation within a group advances one page at a time in
//! round-robin, so none blocks the others for long. Everything runs
//! on the calling thread; "parallel" is page interleaving, not
//! threading.

use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::fields::{Aggregator, Field};
use crate::map::{Alm, SkyMap};
use crate::mapper::{mapper_for, Mapper};
use crate::progress::Progress;
use crate::toc::{toc_match, MapKey, MapPattern, Toc};

/// Options for [`map_catalogs`].
#[derive(Default)]
pub struct MapOptions {
    /// Drive catalogs of equal size and page size in lockstep,
    /// interleaving all their aggregations page by page.
    pub parallel: bool,
    /// Keys must match one of these patterns, if given.
    pub include: Option<Vec<MapPattern>>,
    /// Keys matching any of these patterns are skipped.
    pub exclude: Vec<MapPattern>,
}

/// Make maps for a set of catalogs.
///
/// Returns a [`Toc`] from `(field, catalog)` keys to finished maps,
/// built incrementally; keys failing the include/exclude filter are
/// skipped entirely and their field is never invoked.
pub fn map_catalogs(
    fields: &[(&str, &Field)],
    catalogs: &[(i64, &dyn Catalog)],
    options: &MapOptions,
    mut progress: Option<&mut dyn Progress>,
) -> Result<Toc<MapKey, SkyMap>> {
    let mut out = Toc::new();

    // group catalog indices by (size, page_size) when parallel,
    // otherwise one group per catalog
    let mut groups: Vec<Vec<usize>> = Vec::new();
    if options.parallel {
        let mut shapes: Vec<(u64, usize)> = Vec::new();
        for (ci, &(_, catalog)) in catalogs.iter().enumerate() {
            let shape = (catalog.size(), catalog.page_size());
            match shapes.iter().position(|&s| s == shape) {
                Some(g) => groups[g].push(ci),
                None => {
                    shapes.push(shape);
                    groups.push(vec![ci]);
                }
            }
        }
    } else {
        groups = (0..catalogs.len()).map(|ci| vec![ci]).collect();
    }

    for group in &groups {
        // private aggregator per (field, catalog) pair passing the filter
        let mut aggs: Vec<(MapKey, usize, Box<dyn Aggregator + '_>)> = Vec::new();
        for &ci in group {
            let (bin, catalog) = catalogs[ci];
            for &(name, field) in fields {
                let key = MapKey::new(name, bin);
                if toc_match(&key, options.include.as_deref(), &options.exclude) {
                    debug!(field = name, bin, "starting aggregation");
                    aggs.push((key, ci, field.begin(catalog)?));
                }
            }
        }
        if aggs.is_empty() {
            continue;
        }

        // catalogs that actually need their pages read
        let paged: Vec<usize> = group
            .iter()
            .copied()
            .filter(|&ci| aggs.iter().any(|(_, ai, a)| *ai == ci && a.wants_pages()))
            .collect();

        if !paged.is_empty() {
            // by construction all catalogs of the group share these
            let size = catalogs[paged[0]].1.size();
            let page_size = catalogs[paged[0]].1.page_size() as u64;

            if let Some(progress) = progress.as_deref_mut() {
                progress.begin("mapping", size);
            }

            let mut iterators: Vec<_> = paged
                .iter()
                .map(|&ci| (ci, catalogs[ci].1.pages()))
                .collect();

            let mut row = 0u64;
            while row < size {
                for (ci, pages) in &mut iterators {
                    let page = pages.next().ok_or_else(|| Error::PrematureEnd {
                        catalog: catalogs[*ci].1.label().to_owned(),
                        row,
                    })??;
                    for (_, ai, agg) in &mut aggs {
                        if *ai == *ci && agg.wants_pages() {
                            agg.push(&page)?;
                        }
                    }
                }
                if let Some(progress) = progress.as_deref_mut() {
                    progress.advance(page_size.min(size - row));
                }
                row += page_size;
            }

            if let Some(progress) = progress.as_deref_mut() {
                progress.finish();
            }
        }

        for (key, _, agg) in aggs {
            out.insert(key, agg.finish()?);
        }
    }

    info!(maps = out.len(), "mapped catalogs");
    Ok(out)
}

/// Transform a set of maps to harmonic coefficients.
///
/// Spin-0 maps produce one entry under their original key; spin-2
/// maps produce separate E and B entries under suffixed field names.
/// An explicit `lmax` overrides each map's own band-limit metadata.
pub fn transform_maps(
    maps: &Toc<MapKey, SkyMap>,
    lmax: Option<u32>,
    mut progress: Option<&mut dyn Progress>,
) -> Result<Toc<MapKey, Alm>> {
    let mut out = Toc::new();

    if let Some(progress) = progress.as_deref_mut() {
        progress.begin("transform", maps.len() as u64);
    }

    for (key, map) in maps {
        debug!(
            field = key.field.as_str(),
            bin = key.bin,
            spin = map.meta().spin,
            "transforming map"
        );
        let mapper = mapper_for(map.meta(), lmax);
        for (suffix, alm) in mapper.transform(map)? {
            let field = match suffix {
                Some(suffix) => format!("{}_{}", key.field, suffix),
                None => key.field.clone(),
            };
            out.insert(MapKey::new(field, key.bin), alm);
        }
        if let Some(progress) = progress.as_deref_mut() {
            progress.advance(1);
        }
    }

    if let Some(progress) = progress.as_deref_mut() {
        progress.finish();
    }
    Ok(out)
}
