//! Catalog paging interface and the in-memory catalog.
//!
//! File-backed catalog readers live outside this crate; anything that
//! can serve equal-length column batches through the [`Catalog`]
//! trait can drive the mapping pipeline. [`ArrayCatalog`] is the
//! bundled in-memory implementation used by the test suite and as an
//! adapter target for external readers.

use std::collections::HashMap;

use ndarray::{s, Array1};

use crate::error::{Error, Result};
use crate::map::SkyMap;

/// One batch of rows from a catalog.
///
/// All columns have identical length at all times; the row count of
/// the page is that common length.
#[derive(Clone, Debug)]
pub struct CatalogPage {
    names: Vec<String>,
    columns: HashMap<String, Array1<f64>>,
    size: usize,
}

impl CatalogPage {
    /// Create a page from named columns, checking the equal-length
    /// invariant.
    pub fn new(columns: Vec<(String, Array1<f64>)>) -> Result<Self> {
        let size = columns.first().map_or(0, |(_, v)| v.len());
        for (name, values) in &columns {
            if values.len() != size {
                return Err(Error::PageColumnLength {
                    column: name.clone(),
                    got: values.len(),
                    expected: size,
                });
            }
        }
        let names = columns.iter().map(|(n, _)| n.clone()).collect();
        let columns = columns.into_iter().collect();
        Ok(Self {
            names,
            columns,
            size,
        })
    }

    /// Number of rows in the page.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Column names in the page, in construction order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// One column without validity checking.
    pub fn col(&self, name: &str) -> Result<&Array1<f64>> {
        self.columns
            .get(name)
            .ok_or_else(|| Error::UnknownColumn(name.to_owned()))
    }

    /// One column with validity checking; NaN entries are rejected.
    pub fn get(&self, name: &str) -> Result<&Array1<f64>> {
        let values = self.col(name)?;
        if values.iter().any(|v| v.is_nan()) {
            return Err(Error::InvalidColumn(name.to_owned()));
        }
        Ok(values)
    }

    /// A new page with the flagged rows removed from every column.
    pub fn delete(&self, remove: &[bool]) -> Result<CatalogPage> {
        if remove.len() != self.size {
            return Err(Error::MaskLength {
                got: remove.len(),
                expected: self.size,
            });
        }
        let kept = remove.iter().filter(|&&r| !r).count();
        let mut columns = HashMap::with_capacity(self.columns.len());
        for name in &self.names {
            let old = &self.columns[name];
            let mut new = Vec::with_capacity(kept);
            for (value, &r) in old.iter().zip(remove) {
                if !r {
                    new.push(*value);
                }
            }
            columns.insert(name.clone(), Array1::from_vec(new));
        }
        Ok(CatalogPage {
            names: self.names.clone(),
            columns,
            size: kept,
        })
    }
}

/// A pageable catalog of objects.
///
/// Iterating [`Catalog::pages`] yields batches whose rows sum to
/// [`Catalog::size`] in [`Catalog::page_size`] chunks, the last chunk
/// possibly shorter.
pub trait Catalog {
    /// Human-readable label, recorded in map metadata.
    fn label(&self) -> &str;

    /// Total number of rows.
    fn size(&self) -> u64;

    /// Number of rows per page.
    fn page_size(&self) -> usize;

    /// Optional visibility map of the catalog footprint.
    fn visibility(&self) -> Option<&SkyMap>;

    /// Iterate over the pages of the catalog.
    fn pages(&self) -> Box<dyn Iterator<Item = Result<CatalogPage>> + '_>;
}

/// In-memory catalog over owned column arrays.
#[derive(Clone, Debug)]
pub struct ArrayCatalog {
    label: String,
    columns: Vec<(String, Array1<f64>)>,
    size: usize,
    page_size: usize,
    visibility: Option<SkyMap>,
}

impl ArrayCatalog {
    pub const DEFAULT_PAGE_SIZE: usize = 100_000;

    /// Create a catalog from named columns, checking equal lengths.
    pub fn new(label: impl Into<String>, columns: Vec<(String, Array1<f64>)>) -> Result<Self> {
        let size = columns.first().map_or(0, |(_, v)| v.len());
        for (name, values) in &columns {
            if values.len() != size {
                return Err(Error::PageColumnLength {
                    column: name.clone(),
                    got: values.len(),
                    expected: size,
                });
            }
        }
        Ok(Self {
            label: label.into(),
            columns,
            size,
            page_size: Self::DEFAULT_PAGE_SIZE,
            visibility: None,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        assert!(page_size > 0, "page size must be positive");
        self.page_size = page_size;
        self
    }

    pub fn with_visibility(mut self, visibility: SkyMap) -> Self {
        self.visibility = Some(visibility);
        self
    }
}

impl Catalog for ArrayCatalog {
    fn label(&self) -> &str {
        &self.label
    }

    fn size(&self) -> u64 {
        self.size as u64
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn visibility(&self) -> Option<&SkyMap> {
        self.visibility.as_ref()
    }

    fn pages(&self) -> Box<dyn Iterator<Item = Result<CatalogPage>> + '_> {
        let page_size = self.page_size;
        let size = self.size;
        Box::new((0..size).step_by(page_size).map(move |start| {
            let stop = (start + page_size).min(size);
            CatalogPage::new(
                self.columns
                    .iter()
                    .map(|(name, values)| (name.clone(), values.slice(s![start..stop]).to_owned()))
                    .collect(),
            )
        }))
    }
}
