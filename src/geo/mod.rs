pub mod tiles;

use serde::{Deserialize, Serialize};

use crate::error::AppError;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    /// Rejects coordinates outside the WGS84 domain and non-finite values.
    pub fn validate(&self) -> Result<(), AppError> {
        if !self.lat.is_finite() || !self.lng.is_finite() {
            return Err(AppError::BadRequest(
                "coordinates must be finite numbers".to_string(),
            ));
        }
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(AppError::BadRequest(format!(
                "latitude {} out of range [-90, 90]",
                self.lat
            )));
        }
        if !(-180.0..=180.0).contains(&self.lng) {
            return Err(AppError::BadRequest(format!(
                "longitude {} out of range [-180, 180]",
                self.lng
            )));
        }
        Ok(())
    }
}

/// Great-circle distance in meters over the mean earth radius.
pub fn haversine_m(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let sin_lat = (delta_lat / 2.0).sin();
    let sin_lng = (delta_lng / 2.0).sin();

    let haversine = sin_lat * sin_lat + lat1.cos() * lat2.cos() * sin_lng * sin_lng;
    let central_angle = 2.0 * haversine.sqrt().asin();

    EARTH_RADIUS_M * central_angle
}

#[cfg(test)]
mod tests {
    use super::{GeoPoint, haversine_m};

    #[test]
    fn zero_distance_for_same_point() {
        let p = GeoPoint {
            lat: 53.5511,
            lng: 9.9937,
        };
        let distance = haversine_m(&p, &p);
        assert!(distance < 1e-9);
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
    fn hundredth_of_a_degree_of_latitude_is_about_1_11_km() {
        let origin = GeoPoint { lat: 0.0, lng: 0.0 };
        let north = GeoPoint { lat: 0.01, lng: 0.0 };
        let distance = haversine_m(&origin, &north);
        assert!((distance - 1_112.0).abs() < 5.0);
    }

    #[test]
    fn validate_rejects_out_of_range_coordinates() {
        assert!(GeoPoint { lat: 91.0, lng: 0.0 }.validate().is_err());
        assert!(
            GeoPoint {
                lat: 0.0,
                lng: 181.0
            }
            .validate()
            .is_err()
        );
        assert!(
            GeoPoint {
                lat: f64::NAN,
                lng: 0.0
            }
            .validate()
            .is_err()
        );
        assert!(
            GeoPoint {
                lat: 53.5511,
                lng: 9.9937
            }
            .validate()
            .is_ok()
        );
    }
}
