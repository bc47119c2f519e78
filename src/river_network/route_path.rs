// ===========================================================================
// Binary route paths
// ===========================================================================
//
// A route path names an edge by the branch choices taken to reach it from a
// network outlet: the outlet's fixed-point coordinates followed by one bit
// per edge (0 = primary, 1 = secondary).
//
// Wire layout (big endian):
//   i32 origin x (mm) | i32 origin y (mm) | u32 bit count | packed bits
// Bits are packed MSB first; unused trailing bits of the last byte are zero.

use byteorder::{BigEndian, ReadBytesExt};
use geo::Coord;
use std::fmt;
use std::io::{Cursor, Read};
use thiserror::Error;

use super::record::MILLIMETRES_PER_METRE;

const HEADER_LEN: usize = 12;

#[derive(Error, Debug, PartialEq)]
pub enum RoutePathError {
    #[error("Origin coordinate {0} does not fit in a 32-bit fixed-point value")]
    OriginOutOfRange(f64),
    #[error("Route path truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("Route path has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("Route path has non-zero padding bits")]
    NonZeroPadding,
    #[error("Route path {0} does not survive a serialization round trip")]
    RoundTripMismatch(String),
}

/// Immutable, appendable bit path from an outlet to an edge.
///
/// Ordering is lexicographic by origin, then by bit sequence, with a path
/// sorting before every path it is a prefix of. Because padding bits are
/// always zero, comparing the packed bytes and then the bit count yields
/// exactly that order, so the derived `Ord` is the canonical comparator.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoutePath {
    x: i32,
    y: i32,
    bits: Vec<u8>,
    bit_len: u32,
}

impl RoutePath {
    /// Zero-length path anchored at already fixed-point coordinates.
    pub fn new(x: i32, y: i32) -> Self {
        Self {
            x,
            y,
            bits: Vec::new(),
            bit_len: 0,
        }
    }

    /// Zero-length path anchored at an outlet, coordinates in metres.
    pub fn new_origin(x: f64, y: f64) -> Result<Self, RoutePathError> {
        Ok(Self::new(to_fixed(x)?, to_fixed(y)?))
    }

    pub fn from_coord(coord: Coord) -> Result<Self, RoutePathError> {
        Self::new_origin(coord.x, coord.y)
    }

    pub fn origin(&self) -> (i32, i32) {
        (self.x, self.y)
    }

    /// Number of edges (bits) after the outlet.
    pub fn edge_count(&self) -> usize {
        self.bit_len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.bit_len == 0
    }

    pub fn bit(&self, index: usize) -> Option<bool> {
        if index >= self.edge_count() {
            return None;
        }
        Some(self.bits[index / 8] & (0x80 >> (index % 8)) != 0)
    }

    pub fn bits(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.edge_count()).filter_map(move |i| self.bit(i))
    }

    /// New path with one more branch choice; `self` is left untouched.
    pub fn append(&self, secondary: bool) -> RoutePath {
        let mut next = self.clone();
        let index = next.bit_len as usize;
        if index % 8 == 0 {
            next.bits.push(0);
        }
        if secondary {
            next.bits[index / 8] |= 0x80 >> (index % 8);
        }
        next.bit_len += 1;
        next
    }

    /// True when `prefix` shares this origin and its bits start this path.
    pub fn starts_with(&self, prefix: &RoutePath) -> bool {
        if self.origin() != prefix.origin() || prefix.bit_len > self.bit_len {
            return false;
        }
        let full_bytes = prefix.edge_count() / 8;
        if self.bits[..full_bytes] != prefix.bits[..full_bytes] {
            return false;
        }
        let rest = prefix.edge_count() % 8;
        if rest == 0 {
            return true;
        }
        let mask = !(0xFFu8 >> rest);
        self.bits[full_bytes] & mask == prefix.bits[full_bytes]
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.bits.len());
        out.extend_from_slice(&self.x.to_be_bytes());
        out.extend_from_slice(&self.y.to_be_bytes());
        out.extend_from_slice(&self.bit_len.to_be_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RoutePathError> {
        let truncated = |expected: usize| RoutePathError::Truncated {
            expected,
            found: bytes.len(),
        };
        let mut cursor = Cursor::new(bytes);
        let x = cursor
            .read_i32::<BigEndian>()
            .map_err(|_| truncated(HEADER_LEN))?;
        let y = cursor
            .read_i32::<BigEndian>()
            .map_err(|_| truncated(HEADER_LEN))?;
        let bit_len = cursor
            .read_u32::<BigEndian>()
            .map_err(|_| truncated(HEADER_LEN))?;

        let byte_len = (bit_len as usize).div_ceil(8);
        let expected = HEADER_LEN + byte_len;
        if bytes.len() < expected {
            return Err(truncated(expected));
        }
        let mut bits = vec![0u8; byte_len];
        cursor
            .read_exact(&mut bits)
            .map_err(|_| truncated(expected))?;
        if bytes.len() > expected {
            return Err(RoutePathError::TrailingBytes(bytes.len() - expected));
        }

        let rest = bit_len as usize % 8;
        if rest != 0 {
            if let Some(last) = bits.last() {
                if last & (0xFFu8 >> rest) != 0 {
                    return Err(RoutePathError::NonZeroPadding);
                }
            }
        }

        Ok(Self { x, y, bits, bit_len })
    }

    /// Serialize and confirm the bytes decode back to this exact path.
    /// A mismatch means the path is corrupt and must not be persisted.
    pub fn to_verified_bytes(&self) -> Result<Vec<u8>, RoutePathError> {
        let bytes = self.to_bytes();
        match RoutePath::from_bytes(&bytes) {
            Ok(decoded) if decoded == *self => Ok(bytes),
            _ => Err(RoutePathError::RoundTripMismatch(self.to_string())),
        }
    }

    pub fn equals_bytes(&self, bytes: &[u8]) -> bool {
        self.to_bytes() == bytes
    }
}

fn to_fixed(value: f64) -> Result<i32, RoutePathError> {
    let scaled = (value * MILLIMETRES_PER_METRE).round();
    if scaled.is_finite() && scaled >= i32::MIN as f64 && scaled <= i32::MAX as f64 {
        Ok(scaled as i32)
    } else {
        Err(RoutePathError::OriginOutOfRange(value))
    }
}

impl fmt::Display for RoutePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}:", self.x, self.y)?;
        for bit in self.bits() {
            f.write_str(if bit { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl fmt::Debug for RoutePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoutePath({})", self)
    }
}
