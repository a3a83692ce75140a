// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Encoded polyline decoding.

use super::RoutingError;

/// Precision used by the directions engine (polyline6).
pub const PRECISION: u32 = 6;

/// Decode an encoded polyline into `[lon, lat]` pairs.
pub fn decode(encoded: &str, precision: u32) -> Result<Vec<[f64; 2]>, RoutingError> {
    let factor = 10f64.powi(precision as i32);
    let bytes = encoded.as_bytes();
    let mut coordinates = Vec::new();
    let mut index = 0;
    let mut lat: i64 = 0;
    let mut lon: i64 = 0;

    while index < bytes.len() {
        lat += next_value(bytes, &mut index)?;
        lon += next_value(bytes, &mut index)?;
        coordinates.push([lon as f64 / factor, lat as f64 / factor]);
    }
    Ok(coordinates)
}

fn next_value(bytes: &[u8], index: &mut usize) -> Result<i64, RoutingError> {
    let mut result: i64 = 0;
    let mut shift = 0;
    loop {
        let byte = *bytes.get(*index).ok_or_else(|| {
            RoutingError::Unavailable("truncated polyline in directions response".to_string())
        })?;
        *index += 1;
        if !(63..=126).contains(&byte) || shift > 60 {
            return Err(RoutingError::Unavailable(format!(
                "invalid polyline byte {:#x} at {}",
                byte,
                *index - 1
            )));
        }
        let chunk = i64::from(byte - 63);
        result |= (chunk & 0x1f) << shift;
        shift += 5;
        if chunk < 0x20 {
            break;
        }
    }
    Ok(if result & 1 == 1 { !(result >> 1) } else { result >> 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: &[[f64; 2]], expected: &[[f64; 2]]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a[0] - e[0]).abs() < 1e-9, "{:?} != {:?}", a, e);
            assert!((a[1] - e[1]).abs() < 1e-9, "{:?} != {:?}", a, e);
        }
    }

    #[test]
    fn test_decode_precision_five_reference() {
        // Reference polyline from the format description.
        let decoded = decode("_p~iF~ps|U_ulLnnqC_mqNvxq`@", 5).unwrap();
        assert_close(
            &decoded,
            &[[-120.2, 38.5], [-120.95, 40.7], [-126.453, 43.252]],
        );
    }

    #[test]
    fn test_decode_precision_six_yields_lon_lat() {
        // 54.793700, 9.435300 followed by 54.793710, 9.435290
        let decoded = decode("g}iogBgi{~PSR", PRECISION).unwrap();
        assert_close(&decoded, &[[9.4353, 54.7937], [9.43529, 54.79371]]);
    }

    #[test]
    fn test_decode_empty() {
        assert!(decode("", PRECISION).unwrap().is_empty());
    }

    #[test]
    fn test_decode_truncated() {
        assert!(decode("_p~iF~ps|", 5).is_err());
        assert!(decode("_p~iF", 5).is_err());
    }
}
