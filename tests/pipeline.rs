//! End-to-end pipeline tests: catalogs to maps to spectra to mixing
//! matrices.

use approx::assert_abs_diff_eq;
use ndarray::Array1;
use scorus::healpix::pix::pix2ang_ring;
use scorus::healpix::utils::nside2npix;

use skyspectra::{
    angular_power_spectra, map_catalogs, mixing_matrices, transform_maps, ArrayCatalog, ClKey,
    ClPattern, Field, HealpixMapper, MapKey, MapOptions, Mapper, Metadata, MixingOptions, SkyMap,
    SpectraOptions, WignerKernel,
};

/// lon/lat columns with exactly one object at every cell center.
fn one_per_cell(nside: u32) -> (Array1<f64>, Array1<f64>) {
    let npix = nside2npix(nside as usize);
    let mut lon = Vec::with_capacity(npix);
    let mut lat = Vec::with_capacity(npix);
    for p in 0..npix {
        let ang = pix2ang_ring::<f64>(nside as usize, p);
        lon.push(ang.az.to_degrees());
        lat.push(90.0 - ang.pol.to_degrees());
    }
    (Array1::from_vec(lon), Array1::from_vec(lat))
}

fn survey_catalog(nside: u32, label: &str) -> ArrayCatalog {
    let (lon, lat) = one_per_cell(nside);
    let n = lon.len();
    let g1: Array1<f64> = (0..n).map(|i| 0.1 * (0.3 * i as f64).sin()).collect();
    let g2: Array1<f64> = (0..n).map(|i| 0.1 * (0.7 * i as f64).cos()).collect();
    let w: Array1<f64> = (0..n).map(|i| 1.0 + (i % 4) as f64 * 0.25).collect();
    ArrayCatalog::new(
        label,
        vec![
            ("ra".into(), lon),
            ("dec".into(), lat),
            ("g1".into(), g1),
            ("g2".into(), g2),
            ("w".into(), w),
        ],
    )
    .unwrap()
    .with_page_size(37)
}

#[test]
fn test_uniform_catalog_yields_zero_overdensity_spectrum() {
    let nside = 4;
    let mapper = HealpixMapper::new(nside).with_lmax(8);
    let pos = Field::positions(mapper, "ra", "dec");
    let catalog = survey_catalog(nside, "uniform");

    let maps = map_catalogs(
        &[("P", &pos)],
        &[(0, &catalog)],
        &MapOptions::default(),
        None,
    )
    .unwrap();
    let alms = transform_maps(&maps, None, None).unwrap();
    let cls = angular_power_spectra(&alms, None, &SpectraOptions::default(), None).unwrap();

    let cl = cls.get(&ClKey::new("P", "P", 0, 0)).unwrap();
    for &value in cl.values() {
        assert_abs_diff_eq!(value, 0.0, epsilon = 1e-20);
    }
}

#[test]
fn test_full_pipeline_with_shear_and_masks() {
    let nside = 4;
    let mapper = HealpixMapper::new(nside).with_lmax(8);
    let npix = mapper.npix();

    // full-sky visibility so mask spectra are pure monopole
    let visibility = SkyMap::from_component(
        Array1::ones(npix),
        Metadata::new(skyspectra::Kernel::Healpix, nside, 0),
    );

    let cat0 = survey_catalog(nside, "north").with_visibility(visibility.clone());
    let cat1 = survey_catalog(nside, "south").with_visibility(visibility);

    let pos = Field::positions(mapper.clone(), "ra", "dec").with_mask("V");
    let she = Field::spin2(mapper.clone(), "ra", "dec", "g1", "g2", Some("w")).with_mask("V");
    let vis = Field::visibility(mapper.clone());

    let fields: Vec<(&str, &Field)> = vec![("P", &pos), ("G", &she), ("V", &vis)];
    let catalogs: Vec<(i64, &dyn skyspectra::Catalog)> = vec![(0, &cat0), (1, &cat1)];

    let maps = map_catalogs(
        &fields,
        &catalogs,
        &MapOptions {
            parallel: true,
            ..Default::default()
        },
        None,
    )
    .unwrap();
    assert_eq!(maps.len(), 6);

    // every map carries its provenance
    assert_eq!(
        maps.get(&MapKey::new("G", 1)).unwrap().meta().catalog.as_deref(),
        Some("south")
    );
    assert!(maps.get(&MapKey::new("G", 0)).unwrap().meta().bias.is_some());

    // spin-2 fields split into E and B coefficient entries
    let alms = transform_maps(&maps, None, None).unwrap();
    assert_eq!(alms.len(), 8);
    assert!(alms.get(&MapKey::new("G_E", 0)).is_some());
    assert!(alms.get(&MapKey::new("G_B", 1)).is_some());

    // spectra restricted to the mask entries
    let mask_cls = angular_power_spectra(
        &alms,
        None,
        &SpectraOptions {
            include: Some(vec![ClPattern::fields("V", "V")]),
            ..Default::default()
        },
        None,
    )
    .unwrap();
    assert_eq!(mask_cls.len(), 3);

    // full-sky mask: its auto-spectrum is a pure monopole
    let vv = mask_cls.get(&ClKey::new("V", "V", 0, 0)).unwrap();
    let values = vv.values();
    assert_abs_diff_eq!(values[0], 4.0 * std::f64::consts::PI, epsilon = 1e-6);
    for l in 1..values.len() {
        assert_abs_diff_eq!(values[l], 0.0, epsilon = 1e-4);
    }

    // mixing matrices: P-P, P-G_E and the G-G E/B triple per bin pair
    let mms = mixing_matrices(
        &fields,
        &mask_cls,
        &WignerKernel,
        &MixingOptions::default(),
    );
    assert_eq!(mms.len(), 15);
    assert!(mms.contains_key(&ClKey::new("P", "P", 0, 0)));
    assert!(mms.contains_key(&ClKey::new("P", "G_E", 0, 1)));
    assert!(mms.contains_key(&ClKey::new("G_E", "G_B", 1, 1)));

    // a full-sky mask must not mix modes
    let pp = mms.get(&ClKey::new("P", "P", 0, 0)).unwrap();
    for l1 in 0..pp.nrows() {
        for l2 in 0..pp.ncols() {
            let expected = if l1 == l2 { 1.0 } else { 0.0 };
            assert_abs_diff_eq!(pp[[l1, l2]], expected, epsilon = 1e-3);
        }
    }
}

#[test]
fn test_shear_auto_spectra_carry_two_sided_metadata() {
    let nside = 4;
    let mapper = HealpixMapper::new(nside).with_lmax(8);
    let she = Field::spin2(mapper, "ra", "dec", "g1", "g2", Some("w"));
    let catalog = survey_catalog(nside, "survey");

    let maps = map_catalogs(
        &[("G", &she)],
        &[(0, &catalog)],
        &MapOptions::default(),
        None,
    )
    .unwrap();
    let alms = transform_maps(&maps, None, None).unwrap();
    let cls = angular_power_spectra(&alms, None, &SpectraOptions::default(), None).unwrap();

    // E/B of one field over one bin: EE, EB, BB
    assert_eq!(cls.len(), 3);
    let ee = cls.get(&ClKey::new("G_E", "G_E", 0, 0)).unwrap();
    assert_eq!(ee.meta.meta_1.spin, 2);
    assert_eq!(ee.meta.meta_2.spin, 2);
    assert_eq!(ee.meta.meta_1.catalog.as_deref(), Some("survey"));
    // auto-pair propagates the additive bias
    assert!(ee.meta.bias.is_some());
    let eb = cls.get(&ClKey::new("G_E", "G_B", 0, 0)).unwrap();
    assert!(eb.meta.bias.is_none());
}
