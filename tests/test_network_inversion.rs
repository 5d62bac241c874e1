use approx::assert_abs_diff_eq;
use chrono::{Duration, NaiveDate};
use ndarray::{s, Array3};
use sbas::core::{
    DesignMatrixBuilder, InversionParams, NetworkFilter, NetworkFilterParams, PairExclusion,
    ReferenceDate, ResidualNorm,
};
use sbas::{
    CancellationToken, InsarError, Mask, NetworkGraph, NetworkInversionProcessor, PairMetadata,
    PairStack, PixelStatus, RunInputs, TimeseriesConfig, WeightFunction, WeightedInverter,
};
use std::sync::Arc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn epoch_date(i: usize) -> NaiveDate {
    NaiveDate::from_ymd_opt(2015, 1, 1).unwrap() + Duration::days(12 * i as i64)
}

fn network_from(pairs: &[(usize, usize)]) -> NetworkGraph {
    let records: Vec<PairMetadata> = pairs
        .iter()
        .map(|&(i, j)| PairMetadata {
            date1: epoch_date(i),
            date2: epoch_date(j),
            perp_baseline: 10.0 * (j as f64 - i as f64),
            avg_coherence: 0.8,
        })
        .collect();
    NetworkGraph::from_metadata(&records).expect("valid network")
}

fn complete_pairs(n: usize) -> Vec<(usize, usize)> {
    (0..n).flat_map(|i| ((i + 1)..n).map(move |j| (i, j))).collect()
}

/// Constant-in-space stack built from a per-epoch truth
fn synthetic_stack(pairs: &[(usize, usize)], truth: &[f64], rows: usize, cols: usize) -> PairStack {
    let mut phase = Array3::<f32>::zeros((pairs.len(), rows, cols));
    for (k, &(i, j)) in pairs.iter().enumerate() {
        phase.slice_mut(s![k, .., ..]).fill((truth[j] - truth[i]) as f32);
    }
    PairStack::new(phase)
}

fn small_run_config() -> TimeseriesConfig {
    let mut config = TimeseriesConfig::default();
    config.quality.min_num_pixel = 1;
    config.reference.min_coherence = 0.5;
    config.reference.date = ReferenceDate::First;
    config
}

#[test]
fn test_five_epoch_chain_after_temporal_filter() {
    init_logging();

    // E1-E2, E2-E3, E3-E4, E4-E5 and the redundant E1-E3
    let pairs = [(0, 1), (1, 2), (2, 3), (3, 4), (0, 2)];
    let truth = [0.0, 0.4, 1.1, 1.3, 2.0];

    let mut network = network_from(&pairs);
    let filter = NetworkFilter::with_params(NetworkFilterParams {
        max_temporal_baseline: Some(20.0),
        ..Default::default()
    });
    let report = filter.apply(&mut network).unwrap();
    assert_eq!(report.excluded, vec![(4, PairExclusion::TemporalBaseline)]);
    assert!(report.restored.is_empty());
    assert!(network.is_connected());

    let design = DesignMatrixBuilder::build(&network, None).unwrap();
    assert_eq!((design.nrows(), design.ncols()), (4, 4));

    let mut config = small_run_config();
    config.network.max_temporal_baseline = Some(20.0);
    let mut processor = NetworkInversionProcessor::new(network_from(&pairs), config).unwrap();
    let product = processor
        .run(&synthetic_stack(&pairs, &truth, 2, 2), &RunInputs::default())
        .unwrap();

    let reference = product.reference.as_ref().unwrap();
    assert_eq!(reference.date, epoch_date(0));
    assert_eq!(product.filter_report.excluded.len(), 1);

    // every pixel identical, so anchoring on a pixel leaves only zeros
    for v in product.timeseries.iter() {
        assert_abs_diff_eq!(*v, 0.0, epsilon = 1e-5);
    }
}

#[test]
fn test_chain_values_relative_to_first_epoch() {
    init_logging();
    let pairs = [(0, 1), (1, 2), (2, 3), (3, 4)];
    let truth = [0.3, 0.4, 1.1, 1.3, 2.0];
    let network = network_from(&pairs);

    let design = Arc::new(DesignMatrixBuilder::build(&network, None).unwrap());
    let inverter = WeightedInverter::new(design, &network, InversionParams::default());
    let result = inverter
        .invert_stack(&synthetic_stack(&pairs, &truth, 1, 1), None, None)
        .unwrap();

    for (e, t) in truth.iter().enumerate() {
        assert_abs_diff_eq!(result.timeseries[[e, 0, 0]] as f64, t - truth[0], epsilon = 1e-5);
    }
    assert_abs_diff_eq!(result.temporal_coherence[[0, 0]], 1.0, epsilon = 1e-6);
}

#[test]
fn test_outlier_pair_l2_versus_l1() {
    init_logging();
    let pairs = complete_pairs(5);
    let truth = [0.0, 0.7, 1.2, 2.1, 2.5];
    let network = network_from(&pairs);

    let mut stack = synthetic_stack(&pairs, &truth, 1, 2);
    // unwrapping blunder on pair E2-E4 at the first pixel only
    let blunder = pairs.iter().position(|&p| p == (1, 3)).unwrap();
    stack.phase[[blunder, 0, 0]] += 2.0 * std::f32::consts::PI;

    let design = Arc::new(DesignMatrixBuilder::build(&network, None).unwrap());
    let invert = |norm: ResidualNorm| {
        let params = InversionParams {
            weight_func: WeightFunction::Sbas,
            residual_norm: norm,
            ..Default::default()
        };
        WeightedInverter::new(Arc::clone(&design), &network, params)
            .invert_stack(&stack, None, None)
            .unwrap()
    };
    let l2 = invert(ResidualNorm::L2);
    let l1 = invert(ResidualNorm::L1);

    // elevated residual and reduced coherence where the blunder is observed
    assert!(l2.residual_rms[[0, 0]] > 1.0);
    assert!(l2.residual_rms[[0, 1]] < 1e-5);
    assert!(l2.temporal_coherence[[0, 0]] < l2.temporal_coherence[[0, 1]]);

    let error = |ts: &Array3<f32>| -> f64 {
        truth
            .iter()
            .enumerate()
            .map(|(e, t)| (ts[[e, 0, 0]] as f64 - t).abs())
            .sum()
    };
    assert!(error(&l1.timeseries) < error(&l2.timeseries));
    assert!(error(&l1.timeseries) < 1e-2);
}

#[test]
fn test_pixels_below_minimum_pairs_never_estimated() {
    init_logging();
    let pairs = complete_pairs(4);
    let truth = [0.0, 1.0, 2.0, 3.0];
    let network = network_from(&pairs);
    let num_patterns = 1usize << pairs.len();

    // one column per subset of valid pairs
    let mut stack = synthetic_stack(&pairs, &truth, 1, num_patterns);
    for pattern in 0..num_patterns {
        for k in 0..pairs.len() {
            if pattern & (1 << k) == 0 {
                stack.phase[[k, 0, pattern]] = f32::NAN;
            }
        }
    }

    let design = Arc::new(DesignMatrixBuilder::build(&network, None).unwrap());
    let params = InversionParams {
        min_num_pairs: 4,
        ..Default::default()
    };
    let result = WeightedInverter::new(design, &network, params)
        .invert_stack(&stack, None, None)
        .unwrap();

    for pattern in 0..num_patterns {
        let valid = pattern.count_ones() as usize;
        let status = result.status[[0, pattern]];
        assert_eq!(result.num_valid_pairs[[0, pattern]] as usize, valid);
        if valid < 4 {
            assert_eq!(status, PixelStatus::InsufficientObservations);
            assert!(result.timeseries.slice(s![.., 0, pattern]).iter().all(|v| v.is_nan()));
        } else {
            // four or more of six edges on four nodes always span the graph
            assert_eq!(status, PixelStatus::Valid, "pattern {:06b}", pattern);
            assert_abs_diff_eq!(result.timeseries[[3, 0, pattern]], 3.0, epsilon = 1e-4);
        }
    }
}

#[test]
fn test_masked_pixels_and_cancellation() {
    init_logging();
    let pairs = complete_pairs(4);
    let truth = [0.0, 0.5, 1.0, 1.5];
    let stack = synthetic_stack(&pairs, &truth, 4, 4);

    let mut water = Mask::from_elem((4, 4), true);
    water[[3, 3]] = false;

    let mut processor =
        NetworkInversionProcessor::new(network_from(&pairs), small_run_config()).unwrap();
    let product = processor
        .run(&stack, &RunInputs { validity_mask: Some(&water), ..Default::default() })
        .unwrap();
    assert_eq!(product.status[[3, 3]], PixelStatus::MaskedOut);
    assert!(product.timeseries[[2, 3, 3]].is_nan());
    assert_eq!(product.status_codes()[[3, 3]], PixelStatus::MaskedOut.code());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let product = processor
        .run(&stack, &RunInputs { cancel: Some(&cancel), ..Default::default() })
        .unwrap();
    assert!(product.cancelled);
    assert!(product.reference.is_none());
    assert!(product.status.iter().all(|&s| s == PixelStatus::NotProcessed));
}

#[test]
fn test_run_scoped_failures() {
    init_logging();

    // genuine data gap between E2 and E3
    let pairs = [(0, 1), (2, 3)];
    let mut config = small_run_config();
    config.network.keep_min_span_tree = false;
    let mut processor = NetworkInversionProcessor::new(network_from(&pairs), config).unwrap();
    let err = processor
        .run(&synthetic_stack(&pairs, &[0.0; 4], 2, 2), &RunInputs::default())
        .unwrap_err();
    match err {
        InsarError::DisconnectedNetwork { epochs } => assert!(!epochs.is_empty()),
        other => panic!("unexpected error: {}", other),
    }

    // explicit reference pixel inside the masked area
    let pairs = complete_pairs(3);
    let mut config = small_run_config();
    config.reference.pixel = Some((0, 0));
    let mut mask = Mask::from_elem((2, 2), true);
    mask[[0, 0]] = false;
    let mut processor = NetworkInversionProcessor::new(network_from(&pairs), config).unwrap();
    let result = processor.run(
        &synthetic_stack(&pairs, &[0.0, 1.0, 2.0], 2, 2),
        &RunInputs { validity_mask: Some(&mask), ..Default::default() },
    );
    assert!(matches!(result, Err(InsarError::ReferenceSelection(_))));

    // too few coherent pixels
    let mut config = small_run_config();
    config.quality.min_num_pixel = 100;
    let mut processor = NetworkInversionProcessor::new(network_from(&pairs), config).unwrap();
    let result = processor.run(&synthetic_stack(&pairs, &[0.0, 1.0, 2.0], 2, 2), &RunInputs::default());
    assert!(matches!(
        result,
        Err(InsarError::InsufficientCoherentPixels { found: 4, required: 100 })
    ));
}
