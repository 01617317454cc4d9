//! Encoded polyline codec (the format routing providers return route
//! geometry in), fixed at five decimal places.

use crate::error::AppError;
use crate::models::position::GeoPoint;

const PRECISION: f64 = 1e5;
const CHUNK_BITS: u32 = 5;
const CHUNK_MASK: u64 = 0x1f;
const CONTINUATION: u64 = 0x20;
const ASCII_OFFSET: u8 = 63;

pub fn encode(points: &[GeoPoint]) -> String {
    let mut out = String::with_capacity(points.len() * 8);
    let (mut prev_lat, mut prev_lng) = (0_i64, 0_i64);

    for point in points {
        let lat = (point.lat * PRECISION).round() as i64;
        let lng = (point.lng * PRECISION).round() as i64;
        encode_value(lat - prev_lat, &mut out);
        encode_value(lng - prev_lng, &mut out);
        prev_lat = lat;
        prev_lng = lng;
    }

    out
}

pub fn decode(encoded: &str) -> Result<Vec<GeoPoint>, AppError> {
    let bytes = encoded.as_bytes();
    let mut points = Vec::new();
    let mut cursor = 0;
    let (mut lat, mut lng) = (0_i64, 0_i64);

    while cursor < bytes.len() {
        lat = accumulate(lat, decode_value(bytes, &mut cursor)?)?;
        if cursor >= bytes.len() {
            return Err(AppError::InvalidInput(
                "polyline ends with an unpaired latitude".to_string(),
            ));
        }
        lng = accumulate(lng, decode_value(bytes, &mut cursor)?)?;

        points.push(GeoPoint {
            lat: lat as f64 / PRECISION,
            lng: lng as f64 / PRECISION,
        });
    }

    Ok(points)
}

fn accumulate(total: i64, delta: i64) -> Result<i64, AppError> {
    total
        .checked_add(delta)
        .ok_or_else(|| AppError::InvalidInput("polyline coordinate overflows".to_string()))
}

fn encode_value(delta: i64, out: &mut String) {
    let zigzag = if delta < 0 { !(delta << 1) } else { delta << 1 };
    let mut value = zigzag as u64;

    while value >= CONTINUATION {
        out.push(char::from(
            ((CONTINUATION | (value & CHUNK_MASK)) as u8) + ASCII_OFFSET,
        ));
        value >>= CHUNK_BITS;
    }
    out.push(char::from(value as u8 + ASCII_OFFSET));
}

fn decode_value(bytes: &[u8], cursor: &mut usize) -> Result<i64, AppError> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;

    loop {
        let byte = *bytes.get(*cursor).ok_or_else(|| {
            AppError::InvalidInput("polyline ends mid-value".to_string())
        })?;
        *cursor += 1;

        if !(ASCII_OFFSET..=126).contains(&byte) {
            return Err(AppError::InvalidInput(format!(
                "invalid polyline character at offset {}",
                *cursor - 1
            )));
        }
        if shift > 60 {
            return Err(AppError::InvalidInput("polyline value overflows".to_string()));
        }

        let chunk = u64::from(byte - ASCII_OFFSET);
        result |= (chunk & CHUNK_MASK) << shift;
        shift += CHUNK_BITS;

        if chunk < CONTINUATION {
            break;
        }
    }

    let value = (result >> 1) as i64;
    Ok(if result & 1 == 1 { !value } else { value })
}

#[cfg(test)]
mod tests {
    use super::{decode, encode};
    use crate::error::AppError;
    use crate::models::position::GeoPoint;

    const REFERENCE: &str = "_p~iF~ps|U_ulLnnqC_mqNvxq`@";

    fn reference_points() -> Vec<GeoPoint> {
        vec![
            GeoPoint::new(38.5, -120.2),
            GeoPoint::new(40.7, -120.95),
            GeoPoint::new(43.252, -126.453),
        ]
    }

    #[test]
    fn decodes_reference_polyline() {
        let decoded = decode(REFERENCE).unwrap();
        let expected = reference_points();

        assert_eq!(decoded.len(), expected.len());
        for (got, want) in decoded.iter().zip(&expected) {
            assert!((got.lat - want.lat).abs() < 1e-9);
            assert!((got.lng - want.lng).abs() < 1e-9);
        }
    }

    #[test]
    fn encodes_reference_polyline() {
        assert_eq!(encode(&reference_points()), REFERENCE);
    }

    #[test]
    fn empty_polyline_is_empty_path() {
        assert!(decode("").unwrap().is_empty());
        assert_eq!(encode(&[]), "");
    }

    #[test]
    fn truncated_polyline_is_rejected() {
        assert!(matches!(decode("_p~iF"), Err(AppError::InvalidInput(_))));
        assert!(matches!(decode("_p~"), Err(AppError::InvalidInput(_))));
        assert!(matches!(decode("_p~iF~ps|U\n"), Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn overflowing_coordinates_are_rejected() {
        let huge = "~~~~~~~~~~~~^".repeat(4);
        assert!(matches!(decode(&huge), Err(AppError::InvalidInput(_))));
    }
}
