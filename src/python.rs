//! Python bindings, exposed as the `_core` extension module.

use crate::config::TimeseriesConfig;
use crate::core::epochs::{parse_date12, EpochRegistry};
use crate::core::network::{NetworkGraph, PairMetadata};
use crate::core::pair_selection::{pairs_to_date12, select_pairs, PairSelectionMethod};
use crate::core::processor::{NetworkInversionProcessor, RunInputs};
use crate::types::{InsarError, PairStack};
use numpy::{PyReadonlyArray2, PyReadonlyArray3, ToPyArray};
use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

fn to_py_err(err: InsarError) -> PyErr {
    match err {
        InsarError::Configuration(_) | InsarError::InvalidFormat(_) | InsarError::Json(_) => {
            PyValueError::new_err(err.to_string())
        }
        _ => PyRuntimeError::new_err(err.to_string()),
    }
}

/// Invert a stack of unwrapped interferograms into a displacement time series
#[pyfunction]
#[pyo3(signature = (date12_list, perp_baselines, avg_coherence, phase, coherence=None, validity_mask=None, config_json=None))]
#[allow(clippy::too_many_arguments)]
fn invert_network(
    py: Python,
    date12_list: Vec<String>,
    perp_baselines: Vec<f64>,
    avg_coherence: Vec<f64>,
    phase: PyReadonlyArray3<f32>,
    coherence: Option<PyReadonlyArray3<f32>>,
    validity_mask: Option<PyReadonlyArray2<bool>>,
    config_json: Option<String>,
) -> PyResult<PyObject> {
    if date12_list.len() != perp_baselines.len() || date12_list.len() != avg_coherence.len() {
        return Err(PyValueError::new_err(
            "date12_list, perp_baselines and avg_coherence must have the same length",
        ));
    }

    let mut records = Vec::with_capacity(date12_list.len());
    for ((label, &bperp), &coh) in date12_list.iter().zip(&perp_baselines).zip(&avg_coherence) {
        let (date1, date2) = parse_date12(label).map_err(to_py_err)?;
        records.push(PairMetadata {
            date1,
            date2,
            perp_baseline: bperp,
            avg_coherence: coh,
        });
    }
    let network = NetworkGraph::from_metadata(&records).map_err(to_py_err)?;

    let config = match config_json {
        Some(json) => TimeseriesConfig::from_json_str(&json).map_err(to_py_err)?,
        None => TimeseriesConfig::default(),
    };

    let mut stack = PairStack::new(phase.as_array().to_owned());
    if let Some(coh) = coherence {
        stack = stack.with_coherence(coh.as_array().to_owned());
    }
    let mask = validity_mask.map(|m| m.as_array().to_owned());

    let mut processor = NetworkInversionProcessor::new(network, config).map_err(to_py_err)?;
    let inputs = RunInputs {
        validity_mask: mask.as_ref(),
        ..Default::default()
    };
    let product = py
        .allow_threads(|| processor.run(&stack, &inputs))
        .map_err(to_py_err)?;

    let result = PyDict::new(py);
    result.set_item("timeseries", product.timeseries.to_pyarray(py))?;
    result.set_item("temporal_coherence", product.temporal_coherence.to_pyarray(py))?;
    result.set_item("residual_rms", product.residual_rms.to_pyarray(py))?;
    result.set_item("status", product.status_codes().to_pyarray(py))?;
    result.set_item("dates", product.date_labels())?;
    result.set_item("epoch_residual_rms", product.epoch_residual_rms.clone())?;
    result.set_item("exclude_date_candidates", product.exclude_date_candidates.clone())?;
    result.set_item("restored_pairs", product.filter_report.restored.clone())?;
    result.set_item("orphaned_dates", product.filter_report.orphaned_epochs.clone())?;
    if let Some(reference) = &product.reference {
        result.set_item("reference_yx", reference.pixel)?;
        result.set_item("reference_date", reference.date.format("%Y%m%d").to_string())?;
    }
    result.set_item("cancelled", product.cancelled)?;

    Ok(result.into())
}

/// Design an interferogram network over a list of acquisition dates
#[pyfunction]
#[pyo3(signature = (dates, method="all", perp_baselines=Vec::new(), num_connections=2, master_index=None))]
fn design_network(
    dates: Vec<String>,
    method: &str,
    perp_baselines: Vec<f64>,
    num_connections: usize,
    master_index: Option<usize>,
) -> PyResult<Vec<String>> {
    let refs: Vec<&str> = dates.iter().map(String::as_str).collect();
    let epochs = EpochRegistry::from_date_strings(&refs).map_err(to_py_err)?;

    let method = match method.to_lowercase().as_str() {
        "all" => PairSelectionMethod::All,
        "sequential" => PairSelectionMethod::Sequential { num_connections },
        "mst" => PairSelectionMethod::Mst,
        "delaunay" => PairSelectionMethod::Delaunay,
        "star" => PairSelectionMethod::Star {
            master: master_index,
        },
        other => {
            return Err(PyValueError::new_err(format!(
                "Unknown selection method: {}",
                other
            )))
        }
    };

    let pairs = select_pairs(&method, &epochs, &perp_baselines).map_err(to_py_err)?;
    Ok(pairs_to_date12(&epochs, &pairs))
}

/// Temporal coherence of a residual vector in radians
#[pyfunction]
fn temporal_coherence(residuals: Vec<f64>) -> f64 {
    crate::core::quality::temporal_coherence(&residuals)
}

#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(invert_network, m)?)?;
    m.add_function(wrap_pyfunction!(design_network, m)?)?;
    m.add_function(wrap_pyfunction!(temporal_coherence, m)?)?;
    Ok(())
}
