//! Parameter estimation for density clustering: knee of a distance curve and
//! the Calinski–Harabasz validity score.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use std::collections::BTreeMap;

pub(crate) fn sq_dist(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Full pairwise Euclidean distance matrix.
pub(crate) fn distance_matrix(data: &Array2<f64>) -> Array2<f64> {
    let n = data.nrows();
    let mut d = Array2::zeros((n, n));
    for i in 0..n {
        for j in (i + 1)..n {
            let v = sq_dist(data.row(i), data.row(j)).sqrt();
            d[[i, j]] = v;
            d[[j, i]] = v;
        }
    }
    d
}

/// Distance of every row to its nearest other row, sorted ascending.
pub(crate) fn nearest_neighbour_distances(data: &Array2<f64>) -> Vec<f64> {
    let d = distance_matrix(data);
    let n = data.nrows();
    let mut out: Vec<f64> = (0..n)
        .filter_map(|i| {
            (0..n)
                .filter(|&j| j != i)
                .map(|j| d[[i, j]])
                .min_by(f64::total_cmp)
        })
        .collect();
    out.sort_by(f64::total_cmp);
    out
}

/// Knee of an increasing convex curve: the index where the normalized curve
/// lies furthest below the diagonal. `None` when the curve is too short or flat.
pub(crate) fn knee(ys: &[f64]) -> Option<usize> {
    let n = ys.len();
    if n < 3 {
        return None;
    }
    let lo = ys.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = ys.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = hi - lo;
    if !(span > 0.0) {
        return None;
    }
    let mut best = None;
    let mut best_gap = 0.0;
    for (i, y) in ys.iter().enumerate() {
        let x = i as f64 / (n - 1) as f64;
        let gap = x - (y - lo) / span;
        if gap > best_gap {
            best_gap = gap;
            best = Some(i);
        }
    }
    best
}

pub(crate) fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut v = values.to_vec();
    v.sort_by(f64::total_cmp);
    let mid = v.len() / 2;
    Some(if v.len() % 2 == 0 {
        (v[mid - 1] + v[mid]) / 2.0
    } else {
        v[mid]
    })
}

/// Neighbourhood radius from the knee of a sorted distance curve,
/// falling back to the median and then the largest distance. Always positive.
pub(crate) fn radius_from_curve(curve: &[f64]) -> f64 {
    let candidates = [
        knee(curve).map(|i| curve[i]),
        median(curve),
        curve.iter().copied().reduce(f64::max),
    ];
    candidates
        .into_iter()
        .flatten()
        .find(|r| *r > 0.0 && r.is_finite())
        .unwrap_or(1e-6)
}

pub(crate) fn estimate_eps(data: &Array2<f64>) -> f64 {
    radius_from_curve(&nearest_neighbour_distances(data))
}

/// Between/within dispersion ratio. `None` unless 2 ≤ labels ≤ n − 1.
/// Noise (-1) counts as a label of its own.
pub(crate) fn calinski_harabasz(data: &Array2<f64>, labels: &[i64]) -> Option<f64> {
    let n = data.nrows();
    let mut members: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (i, l) in labels.iter().enumerate() {
        members.entry(*l).or_default().push(i);
    }
    let k = members.len();
    if k < 2 || k >= n {
        return None;
    }

    let mean: Array1<f64> = data.mean_axis(Axis(0))?;
    let mut between = 0.0;
    let mut within = 0.0;
    for rows in members.values() {
        let sub = data.select(Axis(0), rows);
        let centroid = sub.mean_axis(Axis(0))?;
        between += rows.len() as f64 * sq_dist(centroid.view(), mean.view());
        within += sub
            .rows()
            .into_iter()
            .map(|r| sq_dist(r, centroid.view()))
            .sum::<f64>();
    }
    if within == 0.0 {
        return Some(1.0);
    }
    Some(between * (n - k) as f64 / (within * (k - 1) as f64))
}

/// Sweep `candidates` and keep the one with the highest positive score.
/// With no positive score the first candidate wins.
pub(crate) fn best_by_score<F>(candidates: impl IntoIterator<Item = usize>, mut score: F) -> Option<usize>
where
    F: FnMut(usize) -> Option<f64>,
{
    let mut first = None;
    let mut best: Option<(usize, f64)> = None;
    for c in candidates {
        first.get_or_insert(c);
        let s = score(c).unwrap_or(0.0);
        if s > best.map_or(0.0, |(_, b)| b) {
            best = Some((c, s));
        }
    }
    best.map(|(c, _)| c).or(first)
}
