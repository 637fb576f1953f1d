//! Great-circle helpers.

use crate::geocode::Coordinate;

const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Haversine distance in meters.
pub fn haversine_m(a: Coordinate, b: Coordinate) -> f64 {
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());
    let dlat = lat2 - lat1;
    let dlng = (b.lng - a.lng).to_radians();
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().min(1.0).asin()
}

/// Arithmetic mean of the points. `None` when empty.
pub fn centroid(points: &[Coordinate]) -> Option<Coordinate> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (lng, lat) = points
        .iter()
        .fold((0.0, 0.0), |(lng, lat), p| (lng + p.lng, lat + p.lat));
    Some(Coordinate::new(lng / n, lat / n))
}

/// Polar angle of `p` around `center` in radians, east = 0, counter-clockwise.
///
/// Longitude is scaled by cos(latitude) so sectors are not squashed away from the equator.
pub fn polar_angle(center: Coordinate, p: Coordinate) -> f64 {
    let x = (p.lng - center.lng) * center.lat.to_radians().cos();
    let y = p.lat - center.lat;
    y.atan2(x)
}

/// Indices and distance of the two points farthest apart. `None` below two points.
pub fn farthest_pair(points: &[Coordinate]) -> Option<(usize, usize, f64)> {
    let mut best: Option<(usize, usize, f64)> = None;
    for i in 0..points.len() {
        for j in (i + 1)..points.len() {
            let d = haversine_m(points[i], points[j]);
            if best.map_or(true, |(_, _, b)| d > b) {
                best = Some((i, j, d));
            }
        }
    }
    best
}

/// Point halfway along a polyline, by length.
pub fn polyline_midpoint(path: &[Coordinate]) -> Option<Coordinate> {
    match path {
        [] => None,
        [only] => Some(*only),
        _ => {
            let lengths: Vec<f64> = path.windows(2).map(|w| haversine_m(w[0], w[1])).collect();
            let half = lengths.iter().sum::<f64>() / 2.0;
            let mut walked = 0.0;
            for (segment, len) in path.windows(2).zip(&lengths) {
                if walked + len >= half && *len > 0.0 {
                    let t = (half - walked) / len;
                    return Some(Coordinate::new(
                        segment[0].lng + (segment[1].lng - segment[0].lng) * t,
                        segment[0].lat + (segment[1].lat - segment[0].lat) * t,
                    ));
                }
                walked += len;
            }
            path.first().copied()
        }
    }
}
