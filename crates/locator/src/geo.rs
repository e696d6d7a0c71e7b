//! Web Mercator tile math and great-circle distance. Dependency-free by
//! design: the rest of the crate treats position as plain f64 degrees, so
//! there is nothing an external geodesy crate would buy us here.

use serde::{Deserialize, Serialize};

/// Earth radius used for all haversine distances, in kilometers.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Equatorial meters-per-pixel at zoom 0 (a single 256px tile spans the
/// whole globe).
pub const MPP_Z0: f64 = 156543.03392;

const TILE_SIZE: f64 = 256.0;

/// A geodetic point. Latitude and longitude are in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub const ZERO: GeoPoint = GeoPoint { lat: 0.0, lon: 0.0 };

    pub fn is_valid(&self) -> bool {
        self.lat >= -90.0 && self.lat <= 90.0 && self.lon >= -180.0 && self.lon <= 180.0
    }
}

/// A Web Mercator tile address. Unique per zoom level within a pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub z: u32,
    pub x: u32,
    pub y: u32,
}

impl TileCoord {
    pub fn new(z: u32, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Number of tiles per axis at this zoom level: 2^z.
    pub fn tiles_per_axis(&self) -> u32 {
        1u32 << self.z
    }

    /// Meters-per-pixel at the equator for this zoom level.
    pub fn meters_per_pixel(&self) -> f64 {
        MPP_Z0 / (1u64 << self.z) as f64
    }

    fn clamp_xy(&self, x: i64, y: i64) -> (u32, u32) {
        let n = self.tiles_per_axis() as i64;
        (x.clamp(0, n - 1) as u32, y.clamp(0, n - 1) as u32)
    }
}

/// A pixel location within a specific tile, `(px, py) ∈ [0,256)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TilePixel {
    pub tile: TileCoord,
    pub px: f64,
    pub py: f64,
}

/// Converts a tile pixel address to a geodetic position.
pub fn tile_pixel_to_gps(tile: TileCoord, px: f64, py: f64) -> GeoPoint {
    let n = tile.tiles_per_axis() as f64;
    let x = tile.x as f64 + px / TILE_SIZE;
    let y = tile.y as f64 + py / TILE_SIZE;

    let lon = (x / n) * 360.0 - 180.0;
    let lat_rad = (std::f64::consts::PI * (1.0 - 2.0 * y / n)).sinh().atan();
    let lat = lat_rad.to_degrees();

    GeoPoint::new(lat, lon)
}

/// Inverse of [`tile_pixel_to_gps`]. Tile indices are clamped to `[0, 2^z)`.
pub fn gps_to_tile_pixel(p: GeoPoint, z: u32) -> TilePixel {
    let n = (1u64 << z) as f64;
    let lat_rad = p.lat.to_radians();

    let x = (p.lon + 180.0) / 360.0 * n;
    let y = (1.0
        - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI)
        / 2.0
        * n;

    let tx = x.floor() as i64;
    let ty = y.floor() as i64;
    let coord = TileCoord::new(z, 0, 0);
    let (cx, cy) = coord.clamp_xy(tx, ty);
    let tile = TileCoord::new(z, cx, cy);

    let px = (x - tx as f64) * TILE_SIZE;
    let py = (y - ty as f64) * TILE_SIZE;

    TilePixel { tile, px, py }
}

/// Projects a drone-frame center pixel through a homography `H` (row-major
/// 3x3, mapping drone-frame -> tile-frame pixels) into tile-pixel space,
/// then into geodetic coordinates.
///
/// Returns `None` (Degenerate) when the homogeneous component `w` is smaller
/// than `1e-10` in magnitude, which would otherwise produce NaN/inf.
pub fn homography_to_gps(h: &nalgebra::Matrix3<f64>, tile: TileCoord, center: (f64, f64)) -> Option<GeoPoint> {
    let (cx, cy) = center;
    let v = h * nalgebra::Vector3::new(cx, cy, 1.0);
    if v.z.abs() < 1e-10 {
        return None;
    }
    let px = v.x / v.z;
    let py = v.y / v.z;
    Some(tile_pixel_to_gps(tile, px, py))
}

/// Great-circle distance between two points, in kilometers.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

/// Enumerates every tile at `zoom` whose center lies within `1.2 *
/// radius_km` of `center` (a 20% overlap margin), using a latitude-corrected
/// bounding box as a cheap pre-filter before the exact great-circle check.
pub fn tiles_in_radius(center: GeoPoint, radius_km: f64, zoom: u32) -> Vec<TileCoord> {
    let margin_radius_km = radius_km * 1.2;
    let lat_deg_per_km = 1.0 / 110.574;
    let lon_deg_per_km = 1.0 / (111.320 * center.lat.to_radians().cos().max(1e-6));

    let dlat = margin_radius_km * lat_deg_per_km;
    let dlon = margin_radius_km * lon_deg_per_km;

    let north = GeoPoint::new((center.lat + dlat).min(85.0), center.lon);
    let south = GeoPoint::new((center.lat - dlat).max(-85.0), center.lon);
    let east = GeoPoint::new(center.lat, center.lon + dlon);
    let west = GeoPoint::new(center.lat, center.lon - dlon);

    let nw = gps_to_tile_pixel(GeoPoint::new(north.lat, west.lon), zoom).tile;
    let se = gps_to_tile_pixel(GeoPoint::new(south.lat, east.lon), zoom).tile;

    let (x_lo, x_hi) = (nw.x.min(se.x), nw.x.max(se.x));
    let (y_lo, y_hi) = (nw.y.min(se.y), nw.y.max(se.y));

    let mut out = Vec::new();
    for y in y_lo..=y_hi {
        for x in x_lo..=x_hi {
            let tile = TileCoord::new(zoom, x, y);
            let tile_center = tile_pixel_to_gps(tile, 128.0, 128.0);
            if haversine_km(center, tile_center) <= margin_radius_km {
                out.push(tile);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinate_round_trip_within_one_meter() {
        let samples = [
            GeoPoint::new(52.5200, 13.4050),
            GeoPoint::new(-33.8688, 151.2093),
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(84.0, 179.0),
            GeoPoint::new(-84.0, -179.9),
        ];
        for &p in &samples {
            for z in [0u32, 5, 12, 18, 20] {
                let tp = gps_to_tile_pixel(p, z);
                let back = tile_pixel_to_gps(tp.tile, tp.px, tp.py);
                let err_km = haversine_km(p, back);
                assert!(
                    err_km < 0.001,
                    "p={:?} z={z} back={:?} err_km={err_km}",
                    p,
                    back
                );
            }
        }
    }

    #[test]
    fn haversine_zero_for_identical_points() {
        let p = GeoPoint::new(52.52, 13.405);
        assert!(haversine_km(p, p) < 1e-9);
    }

    #[test]
    fn haversine_known_distance_berlin_paris() {
        // Berlin to Paris is roughly 878 km.
        let berlin = GeoPoint::new(52.5200, 13.4050);
        let paris = GeoPoint::new(48.8566, 2.3522);
        let d = haversine_km(berlin, paris);
        assert!((800.0..950.0).contains(&d), "d={d}");
    }

    #[test]
    fn tiles_in_radius_contains_center_tile() {
        let center = GeoPoint::new(52.52, 13.405);
        let zoom = 14;
        let center_tile = gps_to_tile_pixel(center, zoom).tile;
        let tiles = tiles_in_radius(center, 2.0, zoom);
        assert!(tiles.contains(&center_tile));
    }

    #[test]
    fn homography_to_gps_rejects_near_zero_w() {
        let h = nalgebra::Matrix3::new(1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1e-12);
        let tile = TileCoord::new(14, 8800, 5374);
        assert!(homography_to_gps(&h, tile, (128.0, 128.0)).is_none());
    }

    #[test]
    fn tile_coord_meters_per_pixel_halves_per_zoom() {
        let z0 = TileCoord::new(0, 0, 0).meters_per_pixel();
        let z1 = TileCoord::new(1, 0, 0).meters_per_pixel();
        assert!((z0 / 2.0 - z1).abs() < 1e-6);
    }
}
