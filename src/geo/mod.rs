pub mod polyline;

use crate::models::position::GeoPoint;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

pub fn haversine_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().min(1.0).asin();

    EARTH_RADIUS_M * central_angle
}

/// Initial great-circle bearing from `from` to `to`, degrees in [0, 360).
pub fn bearing_deg(from: &GeoPoint, to: &GeoPoint) -> f64 {
    let lat1 = from.lat.to_radians();
    let lat2 = to.lat.to_radians();
    let delta_lng = (to.lng - from.lng).to_radians();

    let y = delta_lng.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * delta_lng.cos();

    y.atan2(x).to_degrees().rem_euclid(360.0)
}

/// Smallest absolute angle between two headings, in [0, 180].
pub fn heading_delta_deg(a: f64, b: f64) -> f64 {
    let diff = (a - b).rem_euclid(360.0);
    if diff > 180.0 { 360.0 - diff } else { diff }
}

/// Planar midpoint; adequate for the short segments of a route polyline.
pub fn midpoint(a: &GeoPoint, b: &GeoPoint) -> GeoPoint {
    GeoPoint {
        lat: (a.lat + b.lat) / 2.0,
        lng: (a.lng + b.lng) / 2.0,
    }
}

/// Points along the great circle from `from` to `to`, both ends included,
/// at most `max_spacing_m` apart unless that would take more than
/// `max_segments` segments, in which case the spacing widens.
pub fn great_circle_path(
    from: &GeoPoint,
    to: &GeoPoint,
    max_spacing_m: f64,
    max_segments: usize,
) -> Vec<GeoPoint> {
    let distance = haversine_m(from, to);
    let angle = distance / EARTH_RADIUS_M;
    let sin_angle = angle.sin();
    if max_spacing_m <= 0.0 || distance <= max_spacing_m || sin_angle.abs() < 1e-12 {
        return vec![*from, *to];
    }

    let segments = ((distance / max_spacing_m).ceil() as usize).clamp(1, max_segments.max(1));

    let (lat1, lng1) = (from.lat.to_radians(), from.lng.to_radians());
    let (lat2, lng2) = (to.lat.to_radians(), to.lng.to_radians());

    let mut path = Vec::with_capacity(segments + 1);
    path.push(*from);
    for i in 1..segments {
        let fraction = i as f64 / segments as f64;
        let a = ((1.0 - fraction) * angle).sin() / sin_angle;
        let b = (fraction * angle).sin() / sin_angle;

        let x = a * lat1.cos() * lng1.cos() + b * lat2.cos() * lng2.cos();
        let y = a * lat1.cos() * lng1.sin() + b * lat2.cos() * lng2.sin();
        let z = a * lat1.sin() + b * lat2.sin();

        path.push(GeoPoint {
            lat: z.atan2((x * x + y * y).sqrt()).to_degrees(),
            lng: y.atan2(x).to_degrees(),
        });
    }
    path.push(*to);
    path
}

/// Approximate distance from `point` to a polyline, in meters.
///
/// The polyline is sampled at the midpoint of each pair of consecutive
/// vertices rather than projected onto segments. A point beside a long
/// straight segment but far from its midpoint reads as farther away than it
/// is. A single-vertex path measures to that vertex; an empty path yields
/// `None`.
pub fn approx_distance_to_polyline_m(point: &GeoPoint, path: &[GeoPoint]) -> Option<f64> {
    match path {
        [] => None,
        [only] => Some(haversine_m(point, only)),
        _ => path
            .windows(2)
            .map(|pair| haversine_m(point, &midpoint(&pair[0], &pair[1])))
            .min_by(f64::total_cmp),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        approx_distance_to_polyline_m, bearing_deg, great_circle_path, haversine_m,
        heading_delta_deg,
    };
    use crate::models::position::GeoPoint;

    #[test]
    fn zero_distance_for_same_point() {
        let p = GeoPoint {
            lat: 53.5511,
            lng: 9.9937,
        };
        let distance = haversine_m(&p, &p);
        assert!(distance < 1e-6);
    }

    #[test]
    fn london_to_paris_is_around_343_km() {
        let london = GeoPoint {
            lat: 51.5074,
            lng: -0.1278,
        };
        let paris = GeoPoint {
            lat: 48.8566,
            lng: 2.3522,
        };
        let distance = haversine_m(&london, &paris);
        assert!((distance - 343_000.0).abs() < 5_000.0);
    }

    #[test]
    fn one_degree_of_longitude_at_equator_is_about_111_km() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(0.0, 1.0);
        assert!((haversine_m(&a, &b) - 111_195.0).abs() < 100.0);
    }

    #[test]
    fn bearings_point_along_cardinal_directions() {
        let origin = GeoPoint::new(0.0, 0.0);
        assert!(bearing_deg(&origin, &GeoPoint::new(1.0, 0.0)).abs() < 1e-9);
        assert!((bearing_deg(&origin, &GeoPoint::new(0.0, 1.0)) - 90.0).abs() < 1e-9);
        assert!((bearing_deg(&origin, &GeoPoint::new(-1.0, 0.0)) - 180.0).abs() < 1e-9);
        assert!((bearing_deg(&origin, &GeoPoint::new(0.0, -1.0)) - 270.0).abs() < 1e-9);
    }

    #[test]
    fn heading_delta_wraps_around_north() {
        assert!((heading_delta_deg(359.0, 1.0) - 2.0).abs() < 1e-9);
        assert!((heading_delta_deg(10.0, 350.0) - 20.0).abs() < 1e-9);
        assert!((heading_delta_deg(90.0, 270.0) - 180.0).abs() < 1e-9);
        assert!(heading_delta_deg(45.0, 45.0).abs() < 1e-9);
    }

    #[test]
    fn polyline_distance_uses_segment_midpoints() {
        let path = [GeoPoint::new(0.0, 0.0), GeoPoint::new(0.0, 0.002)];
        // The midpoint is (0, 0.001); the first vertex itself is ~111 m away from it.
        let at_vertex = approx_distance_to_polyline_m(&GeoPoint::new(0.0, 0.0), &path).unwrap();
        assert!((at_vertex - 111.2).abs() < 1.0);

        let at_midpoint =
            approx_distance_to_polyline_m(&GeoPoint::new(0.0, 0.001), &path).unwrap();
        assert!(at_midpoint < 1e-6);

        assert!(approx_distance_to_polyline_m(&GeoPoint::new(0.0, 0.0), &[]).is_none());
    }

    #[test]
    fn great_circle_path_is_evenly_spaced_and_keeps_its_ends() {
        let from = GeoPoint::new(0.0, 0.0);
        let to = GeoPoint::new(0.0, 0.01);

        let path = great_circle_path(&from, &to, 10.0, 1_000);
        assert_eq!(path.first(), Some(&from));
        assert_eq!(path.last(), Some(&to));
        assert_eq!(path.len(), 113);
        for pair in path.windows(2) {
            assert!(haversine_m(&pair[0], &pair[1]) <= 10.0);
        }

        // Capped segment count widens the spacing instead.
        assert_eq!(great_circle_path(&from, &to, 10.0, 4).len(), 5);
        assert_eq!(great_circle_path(&from, &from, 10.0, 4), vec![from, from]);
    }
}
