use sbas::core::{ObservationMask, RampType, ReferenceDate, ResidualNorm};
use sbas::{InsarError, TimeseriesConfig, WeightFunction};
use std::fs;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_template_file_with_reference_network() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();

    fs::write(
        dir.path().join("reference_date12.txt"),
        "100101-100113\n100113-100125\n",
    )
    .unwrap();
    let template_path = dir.path().join("sbas_template.txt");
    fs::write(
        &template_path,
        "\
########## network modification
pysar.network.coherenceBased   = yes   # [yes / no]
pysar.network.keepMinSpanTree  = auto
pysar.network.minCoherence     = 0.7
pysar.network.excludeDate      = 20100206
pysar.network.excludeIfgIndex  = 0:2,7
pysar.network.referenceFile    = reference_date12.txt
########## inversion
pysar.networkInversion.weightFunc    = var
pysar.networkInversion.residualNorm  = L2
pysar.networkInversion.maskDataset   = coherence
pysar.networkInversion.maskThreshold = 0.3
pysar.networkInversion.minNumPixel   = 50
pysar.reference.minCoherence = 0.9
pysar.reference.date = minRMS
pysar.residualRms.ramp = plane
pysar.residualRms.threshold = 0.02
wavelength = 0.0555
",
    )
    .unwrap();

    let config = TimeseriesConfig::from_template_file(&template_path).unwrap();

    assert!(config.network.coherence_based);
    assert!(config.network.keep_min_span_tree);
    assert_eq!(config.network.min_coherence, 0.7);
    assert_eq!(config.network.exclude_dates.len(), 1);
    assert_eq!(config.network.exclude_pair_indices, vec![0, 1, 2, 7]);
    assert_eq!(config.network.reference_pairs.len(), 2);
    assert_eq!(config.inversion.weight_func, WeightFunction::Var);
    assert_eq!(config.inversion.residual_norm, ResidualNorm::L2);
    assert_eq!(config.inversion.mask_dataset, ObservationMask::Coherence);
    assert_eq!(config.inversion.mask_threshold, 0.3);
    assert_eq!(config.quality.min_num_pixel, 50);
    assert_eq!(config.quality.ramp, RampType::Plane);
    assert_eq!(config.quality.rms_threshold, Some(0.02));
    assert_eq!(config.reference.min_coherence, 0.9);
    assert_eq!(config.reference.date, ReferenceDate::MinRms);
    assert_eq!(config.wavelength, Some(0.0555));
}

#[test]
fn test_json_round_trip() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");

    let mut config = TimeseriesConfig::default();
    config.network.max_temporal_baseline = Some(120.0);
    config.inversion.weight_func = WeightFunction::Coh;
    config.reference.pixel = Some((12, 34));
    fs::write(&path, config.to_json_string().unwrap()).unwrap();

    let loaded = TimeseriesConfig::from_json_file(&path).unwrap();
    assert_eq!(loaded.network.max_temporal_baseline, Some(120.0));
    assert_eq!(loaded.inversion.weight_func, WeightFunction::Coh);
    assert_eq!(loaded.reference.pixel, Some((12, 34)));

    // missing sections fall back to defaults
    let partial = TimeseriesConfig::from_json_str(r#"{"quality": {"min_num_pixel": 5}}"#).unwrap();
    assert_eq!(partial.quality.min_num_pixel, 5);
    assert_eq!(partial.quality.min_temporal_coherence, 0.7);
}

#[test]
fn test_out_of_range_values_rejected() {
    init_logging();
    let bad = [
        r#"{"network": {"min_coherence": 1.5}}"#,
        r#"{"network": {"max_temporal_baseline": -3.0}}"#,
        r#"{"inversion": {"min_num_pairs": 0}}"#,
        r#"{"quality": {"min_temporal_coherence": 2.0}}"#,
        r#"{"temporal_filter": {"time_window": 0.0}}"#,
        r#"{"wavelength": 0.0}"#,
    ];
    for json in bad {
        assert!(
            matches!(TimeseriesConfig::from_json_str(json), Err(InsarError::Configuration(_))),
            "{} should be rejected",
            json
        );
    }

    assert!(matches!(
        TimeseriesConfig::from_json_str("{not json"),
        Err(InsarError::Json(_))
    ));
}
