use std::collections::HashSet;

use geohash::{Coord, decode_bbox, encode, neighbors};

use crate::error::AppError;
use crate::geo::{GeoPoint, haversine_m};

/// Upper bound on a covering set; a radius/precision combination that
/// needs more tiles than this is clipped rather than allowed to grow
/// without bound.
const MAX_COVER_TILES: usize = 256;

/// Geohash cell a point falls into at the given precision.
pub fn tile_for(point: &GeoPoint, precision: usize) -> Result<String, AppError> {
    encode(
        Coord {
            x: point.lng,
            y: point.lat,
        },
        precision,
    )
    .map_err(|err| AppError::Internal(format!("geohash encode failed: {err}")))
}

/// Set of tiles at `precision` whose cells intersect the disk of
/// `radius_m` around `center`, found by ring expansion from the center
/// tile. Pure function of its inputs.
pub fn cover_disk(
    center: &GeoPoint,
    radius_m: f64,
    precision: usize,
) -> Result<HashSet<String>, AppError> {
    let origin = tile_for(center, precision)?;
    let mut covered = HashSet::new();
    covered.insert(origin.clone());

    let mut frontier = vec![origin];
    while !frontier.is_empty() && covered.len() < MAX_COVER_TILES {
        let mut next = Vec::new();
        for tile in frontier.drain(..) {
            let ring = neighbors(&tile)
                .map_err(|err| AppError::Internal(format!("geohash neighbors failed: {err}")))?;
            for candidate in [
                ring.n, ring.ne, ring.e, ring.se, ring.s, ring.sw, ring.w, ring.nw,
            ] {
                if covered.contains(&candidate) {
                    continue;
                }
                if tile_intersects_disk(&candidate, center, radius_m)? {
                    covered.insert(candidate.clone());
                    next.push(candidate);
                }
                if covered.len() >= MAX_COVER_TILES {
                    break;
                }
            }
        }
        frontier = next;
    }

    Ok(covered)
}

/// Whether the tile's bounding box comes within `radius_m` of `center`,
/// measured to the closest point of the box.
fn tile_intersects_disk(tile: &str, center: &GeoPoint, radius_m: f64) -> Result<bool, AppError> {
    let bbox = decode_bbox(tile)
        .map_err(|err| AppError::Internal(format!("geohash decode failed: {err}")))?;

    let nearest = GeoPoint {
        lat: center.lat.clamp(bbox.min().y, bbox.max().y),
        lng: center.lng.clamp(bbox.min().x, bbox.max().x),
    };

    Ok(haversine_m(&nearest, center) <= radius_m)
}
