// Copyright (C) 2025 pwnthemall contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flag encoding.
//!
//! Text flags are stored as lowercase SHA-256 hex of the plaintext. Geo flags
//! are stored as `geo:<lat>,<lng>,<radius_km>` and never hashed.

use sha2::{Digest, Sha256};

use crate::geo;
use crate::models::GeoSpec;

const GEO_PREFIX: &str = "geo:";

/// Stored length cap for incorrect submissions.
pub const MAX_SUBMISSION_LEN: usize = 256;

/// SHA-256 hex digest of a plaintext flag.
pub fn hash_flag(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

/// Encode a geo spec as a flag value.
pub fn encode_geo(spec: &GeoSpec) -> String {
    format!(
        "{}{},{},{}",
        GEO_PREFIX, spec.target_lat, spec.target_lng, spec.radius_km
    )
}

/// Decode a `geo:` flag value; `None` for hashes or malformed specs.
pub fn decode_geo(value: &str) -> Option<GeoSpec> {
    let rest = value.strip_prefix(GEO_PREFIX)?;
    let mut parts = rest.split(',').map(|p| p.trim().parse::<f64>());
    let target_lat = parts.next()?.ok()?;
    let target_lng = parts.next()?.ok()?;
    let radius_km = parts.next()?.ok()?;
    if parts.next().is_some() || radius_km <= 0.0 {
        return None;
    }
    Some(GeoSpec {
        target_lat,
        target_lng,
        radius_km,
    })
}

/// Whether a stored value is a geo spec rather than a hash.
pub fn is_geo(value: &str) -> bool {
    value.starts_with(GEO_PREFIX)
}

/// Submission text recorded for a coordinate guess.
pub fn geo_submission_value(lat: f64, lng: f64) -> String {
    format!("{}{:.6},{:.6}", GEO_PREFIX, lat, lng)
}

/// Check a plaintext against stored flag values.
pub fn matches_text<'a>(plaintext: &str, stored: impl IntoIterator<Item = &'a str>) -> bool {
    let digest = hash_flag(plaintext);
    stored
        .into_iter()
        .filter(|v| !is_geo(v))
        .any(|v| v.eq_ignore_ascii_case(&digest))
}

/// Check a coordinate guess against geo specs.
pub fn matches_geo<'a>(lat: f64, lng: f64, specs: impl IntoIterator<Item = &'a GeoSpec>) -> bool {
    specs
        .into_iter()
        .any(|s| geo::is_within_radius_km(s.target_lat, s.target_lng, lat, lng, s.radius_km))
}

/// Truncate a wrong answer before it is stored.
pub fn truncate_submission(value: &str) -> String {
    if value.len() <= MAX_SUBMISSION_LEN {
        return value.to_string();
    }
    let mut end = MAX_SUBMISSION_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}
