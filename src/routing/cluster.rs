//! Stop clustering.
//!
//! Angular sweep around a center point, cut into balanced contiguous sectors,
//! then a bounded k-means style refinement that never breaks the size limit.

use crate::geocode::Coordinate;
use crate::routing::geo::{centroid, haversine_m, polar_angle};

/// Refinement passes before giving up on convergence.
const MAX_REFINE_PASSES: usize = 20;

/// Partition `points` into `k` clusters of point indices.
///
/// Every index appears in exactly one cluster; no cluster is empty when
/// `k <= points.len()`; no cluster exceeds `max_size` after refinement.
pub fn sweep_clusters(
    points: &[Coordinate],
    center: Coordinate,
    k: usize,
    balance_tolerance: f64,
    max_size: Option<usize>,
) -> Vec<Vec<usize>> {
    let n = points.len();
    if n == 0 || k == 0 {
        return Vec::new();
    }
    let k = k.min(n);

    let order = sweep_order(points, center);
    let mut clusters = Vec::with_capacity(k);
    let (base, extra) = (n / k, n % k);
    let mut start = 0;
    for c in 0..k {
        let size = base + usize::from(c < extra);
        clusters.push(order[start..start + size].to_vec());
        start += size;
    }

    let target = n as f64 / k as f64;
    let mut limit = (target * (1.0 + balance_tolerance.max(0.0))).ceil() as usize;
    limit = limit.max(target.ceil() as usize);
    if let Some(cap) = max_size {
        limit = limit.min(cap.max(1));
    }
    refine(points, &mut clusters, limit);
    clusters
}

/// Indices sorted by polar angle, starting right after the widest angular gap.
fn sweep_order(points: &[Coordinate], center: Coordinate) -> Vec<usize> {
    let mut order: Vec<(f64, usize)> = points
        .iter()
        .enumerate()
        .map(|(i, p)| (polar_angle(center, *p), i))
        .collect();
    order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

    let n = order.len();
    let mut widest = (0.0, 0);
    for i in 0..n {
        let here = order[i].0;
        let next = if i + 1 < n {
            order[i + 1].0
        } else {
            order[0].0 + std::f64::consts::TAU
        };
        if next - here > widest.0 {
            widest = (next - here, (i + 1) % n);
        }
    }
    order.rotate_left(widest.1);
    order.into_iter().map(|(_, i)| i).collect()
}

fn centroids(points: &[Coordinate], clusters: &[Vec<usize>]) -> Vec<Coordinate> {
    clusters
        .iter()
        .map(|members| {
            let pts: Vec<Coordinate> = members.iter().map(|&i| points[i]).collect();
            centroid(&pts).unwrap_or(Coordinate::new(0.0, 0.0))
        })
        .collect()
}

/// Move points to a nearer centroid while sizes stay within `limit`.
fn refine(points: &[Coordinate], clusters: &mut [Vec<usize>], limit: usize) {
    for pass in 0..MAX_REFINE_PASSES {
        let centers = centroids(points, clusters);
        let mut moved = 0;

        let mut assignment: Vec<(usize, usize)> = clusters
            .iter()
            .enumerate()
            .flat_map(|(c, members)| members.iter().map(move |&i| (i, c)))
            .collect();
        assignment.sort_unstable();

        for (point, current) in assignment {
            let here = haversine_m(points[point], centers[current]);
            let mut best: Option<(usize, f64)> = None;
            for (c, center) in centers.iter().enumerate() {
                if c == current || clusters[c].len() >= limit {
                    continue;
                }
                let d = haversine_m(points[point], *center);
                if d < here && best.map_or(true, |(_, b)| d < b) {
                    best = Some((c, d));
                }
            }
            if let Some((target, _)) = best {
                if clusters[current].len() > 1 {
                    clusters[current].retain(|&i| i != point);
                    clusters[target].push(point);
                    moved += 1;
                }
            }
        }

        if moved == 0 {
            tracing::trace!(passes = pass + 1, "Cluster refinement converged");
            break;
        }
    }
    for members in clusters.iter_mut() {
        members.sort_unstable();
    }
}
