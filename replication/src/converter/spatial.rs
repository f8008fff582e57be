//! Well-known-binary parsing for MySQL `point` and `polygon` columns.
//!
//! MySQL prefixes plain WKB with a 4-byte SRID; both layouts are accepted.
//! The byte-order byte selects little/big endian for everything after it.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use common::err::{CResult, ReplError};

const WKB_POINT: u32 = 1;
const WKB_POLYGON: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Endian {
    Big,
    Little,
}

fn read_u32(data: &[u8], endian: Endian) -> u32 {
    match endian {
        Endian::Big => BigEndian::read_u32(data),
        Endian::Little => LittleEndian::read_u32(data),
    }
}

fn read_f64(data: &[u8], endian: Endian) -> f64 {
    match endian {
        Endian::Big => BigEndian::read_f64(data),
        Endian::Little => LittleEndian::read_f64(data),
    }
}

fn byte_order(byte: u8) -> CResult<Endian> {
    match byte {
        0 => Ok(Endian::Big),
        1 => Ok(Endian::Little),
        other => Err(ReplError::ParseError(format!(
            "invalid byte order {} in WKB value",
            other
        ))),
    }
}

/// Parse a WKB POINT, with or without the SRID prefix, into `(x, y)`.
/// `None` payloads map to the origin.
pub fn parse_mysql_point(binary: Option<&[u8]>) -> CResult<(f64, f64)> {
    let binary = match binary {
        Some(binary) => binary,
        None => return Ok((0.0, 0.0)),
    };

    let offset = match binary.len() {
        21 => 0,
        25 => 4,
        other => {
            return Err(ReplError::ParseError(format!(
                "invalid binary length {} for WKB POINT",
                other
            )))
        }
    };

    let endian = byte_order(binary[offset])?;
    let wkb_type = read_u32(&binary[offset + 1..offset + 5], endian);
    if wkb_type != WKB_POINT {
        return Err(ReplError::ParseError(format!(
            "not a WKB POINT type: {}",
            wkb_type
        )));
    }
    let x = read_f64(&binary[offset + 5..offset + 13], endian);
    let y = read_f64(&binary[offset + 13..offset + 21], endian);
    Ok((x, y))
}

/// Parse the outer ring of a WKB POLYGON into its vertices.
pub fn parse_mysql_polygon(binary: Option<&[u8]>) -> CResult<Vec<(f64, f64)>> {
    let binary = match binary {
        Some(binary) => binary,
        None => return Ok(Vec::new()),
    };

    // 25 bytes of header with SRID, 21 without
    let offset = if binary.len() > 25 { 4 } else { 0 };
    if binary.len() < offset + 9 {
        return Err(ReplError::ParseError(
            "truncated WKB POLYGON header".to_string(),
        ));
    }

    let endian = byte_order(binary[offset])?;
    let wkb_type = read_u32(&binary[offset + 1..offset + 5], endian);
    if wkb_type != WKB_POLYGON {
        return Err(ReplError::ParseError(format!(
            "not a WKB POLYGON type: {}",
            wkb_type
        )));
    }

    let num_rings = read_u32(&binary[offset + 5..offset + 9], endian);
    if num_rings == 0 {
        return Ok(Vec::new());
    }

    // only the outer boundary; holes are not represented in the target type
    let ring_offset = offset + 9;
    if binary.len() < ring_offset + 4 {
        return Err(ReplError::ParseError(
            "truncated WKB POLYGON ring".to_string(),
        ));
    }
    let num_points = read_u32(&binary[ring_offset..ring_offset + 4], endian) as usize;

    let mut points = Vec::with_capacity(num_points);
    for i in 0..num_points {
        let point_offset = ring_offset + 4 + i * 16;
        if binary.len() < point_offset + 16 {
            return Err(ReplError::ParseError(
                "truncated WKB POLYGON points".to_string(),
            ));
        }
        let x = read_f64(&binary[point_offset..point_offset + 8], endian);
        let y = read_f64(&binary[point_offset + 8..point_offset + 16], endian);
        points.push((x, y));
    }
    Ok(points)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wkb_point(x: f64, y: f64, srid: Option<u32>) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(srid) = srid {
            out.extend_from_slice(&srid.to_be_bytes());
        }
        out.push(1); // little endian
        out.extend_from_slice(&WKB_POINT.to_le_bytes());
        out.extend_from_slice(&x.to_le_bytes());
        out.extend_from_slice(&y.to_le_bytes());
        out
    }

    fn wkb_polygon(points: &[(f64, f64)], srid: Option<u32>) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(srid) = srid {
            out.extend_from_slice(&srid.to_be_bytes());
        }
        out.push(1);
        out.extend_from_slice(&WKB_POLYGON.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes()); // one ring
        out.extend_from_slice(&(points.len() as u32).to_le_bytes());
        for (x, y) in points {
            out.extend_from_slice(&x.to_le_bytes());
            out.extend_from_slice(&y.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_point_without_srid() {
        let data = wkb_point(10.5, -3.25, None);
        assert_eq!(parse_mysql_point(Some(&data)).unwrap(), (10.5, -3.25));
    }

    #[test]
    fn test_point_with_srid() {
        let data = wkb_point(1.0, 2.0, Some(4326));
        assert_eq!(parse_mysql_point(Some(&data)).unwrap(), (1.0, 2.0));
    }

    #[test]
    fn test_point_null() {
        assert_eq!(parse_mysql_point(None).unwrap(), (0.0, 0.0));
    }

    #[test]
    fn test_point_bad_length() {
        assert!(parse_mysql_point(Some(&[1, 2, 3])).is_err());
    }

    #[test]
    fn test_polygon_with_srid() {
        let points = [(0.0, 0.0), (4.0, 0.0), (4.0, 4.0), (0.0, 0.0)];
        let data = wkb_polygon(&points, Some(0));
        assert_eq!(parse_mysql_polygon(Some(&data)).unwrap(), points.to_vec());
    }

    #[test]
    fn test_polygon_null() {
        assert!(parse_mysql_polygon(None).unwrap().is_empty());
    }
}
