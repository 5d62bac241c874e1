//! Network design: which acquisition pairs to form.
//!
//! Pairs are returned as sorted `(earlier, later)` epoch indices into the
//! registry. Perpendicular baselines are per epoch, relative to a common
//! master orbit.

use crate::core::epochs::{format_date12, EpochRegistry};
use crate::core::network::NetworkGraph;
use crate::types::{InsarError, InsarResult};
use petgraph::algo::min_spanning_tree;
use petgraph::data::Element;
use petgraph::graph::UnGraph;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Pair selection strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PairSelectionMethod {
    All,
    /// Each acquisition paired with its N preceding acquisitions
    Sequential { num_connections: usize },
    /// Union of all pairs under each (temporal days, perpendicular meters) limit
    Hierarchical { thresholds: Vec<(f64, f64)> },
    /// Minimum spanning tree in the normalised baseline plane
    Mst,
    /// Delaunay triangulation edges in the normalised baseline plane
    Delaunay,
    /// Single master; automatic master when None
    Star { master: Option<usize> },
}

/// Select pairs over the registry's epochs (exclusion flags are ignored)
pub fn select_pairs(
    method: &PairSelectionMethod,
    epochs: &EpochRegistry,
    perp_baselines: &[f64],
) -> InsarResult<Vec<(usize, usize)>> {
    let n = epochs.len();
    let needs_baselines = matches!(
        method,
        PairSelectionMethod::Hierarchical { .. }
            | PairSelectionMethod::Mst
            | PairSelectionMethod::Delaunay
    );
    if (needs_baselines || !perp_baselines.is_empty()) && perp_baselines.len() != n {
        return Err(InsarError::InvalidFormat(format!(
            "{} perpendicular baselines for {} epochs",
            perp_baselines.len(),
            n
        )));
    }

    let tbase: Vec<f64> = epochs.tbase_days().into_iter().map(|d| d as f64).collect();
    let pairs = match method {
        PairSelectionMethod::All => select_pairs_all(n),
        PairSelectionMethod::Sequential { num_connections } => {
            select_pairs_sequential(n, *num_connections)
        }
        PairSelectionMethod::Hierarchical { thresholds } => {
            select_pairs_hierarchical(&tbase, perp_baselines, thresholds)
        }
        PairSelectionMethod::Mst => select_pairs_mst(&tbase, perp_baselines),
        PairSelectionMethod::Delaunay => select_pairs_delaunay(&tbase, perp_baselines),
        PairSelectionMethod::Star { master } => {
            let master = match master {
                Some(m) if *m < n => *m,
                Some(m) => {
                    return Err(InsarError::Configuration(format!(
                        "Master epoch index {} outside {} epochs",
                        m, n
                    )))
                }
                None => select_master_date(&tbase, perp_baselines),
            };
            select_pairs_star(n, master)
        }
    };

    log::info!("{:?}: {} pairs over {} epochs", method, pairs.len(), n);
    Ok(pairs)
}

pub fn select_pairs_all(n: usize) -> Vec<(usize, usize)> {
    (0..n)
        .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
        .collect()
}

pub fn select_pairs_sequential(n: usize, num_connections: usize) -> Vec<(usize, usize)> {
    let mut pairs: Vec<(usize, usize)> = (0..n)
        .flat_map(|j| (1..=num_connections).filter(move |&k| k <= j).map(move |k| (j - k, j)))
        .collect();
    pairs.sort_unstable();
    pairs
}

pub fn select_pairs_hierarchical(
    tbase: &[f64],
    perp_baselines: &[f64],
    thresholds: &[(f64, f64)],
) -> Vec<(usize, usize)> {
    let mut selected = BTreeSet::new();
    for &(tmax, pmax) in thresholds {
        for (i, j) in select_pairs_all(tbase.len()) {
            if tbase[j] - tbase[i] <= tmax && (perp_baselines[j] - perp_baselines[i]).abs() <= pmax {
                selected.insert((i, j));
            }
        }
    }
    selected.into_iter().collect()
}

pub fn select_pairs_star(n: usize, master: usize) -> Vec<(usize, usize)> {
    (0..n)
        .filter(|&i| i != master)
        .map(|i| if i < master { (i, master) } else { (master, i) })
        .collect()
}

/// Factor bringing temporal baselines to the perpendicular baseline span
fn temporal_scale(tbase: &[f64], perp_baselines: &[f64]) -> f64 {
    let span = |v: &[f64]| {
        let max = v.iter().cloned().fold(f64::MIN, f64::max);
        let min = v.iter().cloned().fold(f64::MAX, f64::min);
        max - min
    };
    let t_span = span(tbase);
    if t_span > 0.0 && span(perp_baselines) > 0.0 {
        span(perp_baselines) / t_span
    } else {
        1.0
    }
}

/// Distance in the temporal/perpendicular plane, temporal axis scaled to
/// the perpendicular baseline span
pub fn baseline_distance(tbase: &[f64], perp_baselines: &[f64]) -> Vec<Vec<f64>> {
    let scale = temporal_scale(tbase, perp_baselines);
    let n = tbase.len();
    (0..n)
        .map(|i| {
            (0..n)
                .map(|j| {
                    let dt = (tbase[i] - tbase[j]) * scale;
                    let dp = perp_baselines[i] - perp_baselines[j];
                    (dt * dt + dp * dp).sqrt()
                })
                .collect()
        })
        .collect()
}

pub fn select_pairs_mst(tbase: &[f64], perp_baselines: &[f64]) -> Vec<(usize, usize)> {
    let distance = baseline_distance(tbase, perp_baselines);
    let n = tbase.len();

    let mut graph = UnGraph::<(), f64>::with_capacity(n, n * n.saturating_sub(1) / 2);
    let nodes: Vec<_> = (0..n).map(|_| graph.add_node(())).collect();
    for (i, j) in select_pairs_all(n) {
        graph.add_edge(nodes[i], nodes[j], distance[i][j]);
    }
    spanning_edges(&graph)
}

/// Delaunay triangulation (Bowyer-Watson) of the epochs in the normalised
/// baseline plane. Collinear epochs are chained in plane order.
pub fn select_pairs_delaunay(tbase: &[f64], perp_baselines: &[f64]) -> Vec<(usize, usize)> {
    let scale = temporal_scale(tbase, perp_baselines);
    let mut points: Vec<(f64, f64)> = tbase
        .iter()
        .zip(perp_baselines)
        .map(|(&t, &p)| (t * scale, p))
        .collect();
    let n = points.len();

    if n < 3 || is_collinear(&points) {
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| {
            points[a]
                .0
                .total_cmp(&points[b].0)
                .then(points[a].1.total_cmp(&points[b].1))
        });
        let mut pairs: Vec<(usize, usize)> = order
            .windows(2)
            .map(|w| (w[0].min(w[1]), w[0].max(w[1])))
            .collect();
        pairs.sort_unstable();
        return pairs;
    }

    // enclosing triangle, vertices n..n+3
    let (min_x, max_x, min_y, max_y) = points.iter().fold(
        (f64::MAX, f64::MIN, f64::MAX, f64::MIN),
        |(x0, x1, y0, y1), &(x, y)| (x0.min(x), x1.max(x), y0.min(y), y1.max(y)),
    );
    let d = (max_x - min_x).max(max_y - min_y).max(1.0);
    let (mid_x, mid_y) = ((min_x + max_x) / 2.0, (min_y + max_y) / 2.0);
    points.push((mid_x - 20.0 * d, mid_y - d));
    points.push((mid_x, mid_y + 20.0 * d));
    points.push((mid_x + 20.0 * d, mid_y - d));

    let mut triangles: Vec<[usize; 3]> = vec![[n, n + 1, n + 2]];
    for i in 0..n {
        let p = points[i];
        let (bad, good): (Vec<[usize; 3]>, Vec<[usize; 3]>) = triangles
            .into_iter()
            .partition(|t| in_circumcircle(&points, t, p));

        // boundary of the cavity: edges owned by exactly one bad triangle
        let mut edges: Vec<(usize, usize)> = Vec::with_capacity(bad.len() * 3);
        for t in &bad {
            for (a, b) in [(t[0], t[1]), (t[1], t[2]), (t[2], t[0])] {
                edges.push((a.min(b), a.max(b)));
            }
        }
        let boundary: Vec<(usize, usize)> = edges
            .iter()
            .filter(|e| edges.iter().filter(|o| o == e).count() == 1)
            .copied()
            .collect();

        triangles = good;
        triangles.extend(boundary.into_iter().map(|(a, b)| [a, b, i]));
    }

    let mut pairs = BTreeSet::new();
    for t in triangles.iter().filter(|t| t.iter().all(|&v| v < n)) {
        for (a, b) in [(t[0], t[1]), (t[1], t[2]), (t[2], t[0])] {
            pairs.insert((a.min(b), a.max(b)));
        }
    }
    pairs.into_iter().collect()
}

fn is_collinear(points: &[(f64, f64)]) -> bool {
    let Some((&a, rest)) = points.split_first() else {
        return true;
    };
    let Some(&b) = rest.iter().find(|&&p| p != a) else {
        return true;
    };
    let extent = rest
        .iter()
        .map(|&(x, y)| (x - a.0).abs().max((y - a.1).abs()))
        .fold(0.0, f64::max);
    rest.iter().all(|&c| {
        let cross = (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0);
        cross.abs() <= 1e-9 * extent * extent
    })
}

/// Whether `p` lies strictly inside the circumcircle of triangle `t`
fn in_circumcircle(points: &[(f64, f64)], t: &[usize; 3], p: (f64, f64)) -> bool {
    let (a, b, c) = (points[t[0]], points[t[1]], points[t[2]]);
    let d = 2.0 * (a.0 * (b.1 - c.1) + b.0 * (c.1 - a.1) + c.0 * (a.1 - b.1));
    if d == 0.0 {
        return false;
    }
    let sq = |q: (f64, f64)| q.0 * q.0 + q.1 * q.1;
    let ux = (sq(a) * (b.1 - c.1) + sq(b) * (c.1 - a.1) + sq(c) * (a.1 - b.1)) / d;
    let uy = (sq(a) * (c.0 - b.0) + sq(b) * (a.0 - c.0) + sq(c) * (b.0 - a.0)) / d;
    let r2 = (a.0 - ux).powi(2) + (a.1 - uy).powi(2);
    let dist2 = (p.0 - ux).powi(2) + (p.1 - uy).powi(2);
    dist2 < r2 * (1.0 - 1e-12)
}

/// Minimum spanning forest of the candidate pairs weighted by inverse
/// average coherence; returns candidate pair indices
pub fn coherence_mst(network: &NetworkGraph) -> Vec<usize> {
    let epochs = network.epochs();
    let mut graph = UnGraph::<(), f64>::with_capacity(epochs.len(), network.num_pairs());
    let nodes: Vec<_> = (0..epochs.len()).map(|_| graph.add_node(())).collect();

    for pair in network.pairs() {
        if epochs.is_excluded(pair.primary) || epochs.is_excluded(pair.secondary) {
            continue;
        }
        let weight = 1.0 / pair.avg_coherence.max(f64::MIN_POSITIVE);
        graph.add_edge(nodes[pair.primary], nodes[pair.secondary], weight);
    }

    let mut indices: Vec<usize> = spanning_edges(&graph)
        .into_iter()
        .filter_map(|(i, j)| network.pair_index(epochs.date(i), epochs.date(j)))
        .collect();
    indices.sort_unstable();
    indices
}

fn spanning_edges(graph: &UnGraph<(), f64>) -> Vec<(usize, usize)> {
    let mut edges: Vec<(usize, usize)> = min_spanning_tree(graph)
        .filter_map(|element| match element {
            Element::Edge { source, target, .. } => Some((source.min(target), source.max(target))),
            Element::Node { .. } => None,
        })
        .collect();
    edges.sort_unstable();
    edges
}

/// Master epoch minimising the mean baseline distance to all others;
/// the middle acquisition without baselines
pub fn select_master_date(tbase: &[f64], perp_baselines: &[f64]) -> usize {
    if perp_baselines.len() != tbase.len() || tbase.is_empty() {
        return tbase.len() / 2;
    }
    let distance = baseline_distance(tbase, perp_baselines);
    distance
        .iter()
        .map(|row| row.iter().sum::<f64>() / row.len() as f64)
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map_or(0, |(i, _)| i)
}

/// `YYMMDD-YYMMDD` labels of selected pairs
pub fn pairs_to_date12(epochs: &EpochRegistry, pairs: &[(usize, usize)]) -> Vec<String> {
    pairs
        .iter()
        .map(|&(i, j)| format_date12(epochs.date(i), epochs.date(j)))
        .collect()
}
