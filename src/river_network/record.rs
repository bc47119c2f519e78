// ===========================================================================
// Segment records (the input side of the network)
// ===========================================================================
//
// A record is what the external loader hands us: one directed stream segment
// with its identifying codes, a length, two endpoints and optionally the
// interior vertices of its line. Everything downstream of here works in
// millimetre fixed point for lengths.

use geo::Coord;
use serde::{Deserialize, Serialize};

/// Scale used for every length and route origin: 1 unit = 1 mm.
pub const MILLIMETRES_PER_METRE: f64 = 1000.0;

/// Local watershed code used when a record has none.
pub const DEFAULT_LOCAL_WATERSHED_CODE: &str = "000000";

/// Round a length in metres to millimetre precision.
pub fn round_mm(metres: f64) -> f64 {
    (metres * MILLIMETRES_PER_METRE).round() / MILLIMETRES_PER_METRE
}

/// Convert metres to an integer millimetre count.
pub fn to_mm(metres: f64) -> i64 {
    (metres * MILLIMETRES_PER_METRE).round() as i64
}

/// Convert an integer millimetre count back to metres.
pub fn from_mm(mm: i64) -> f64 {
    mm as f64 / MILLIMETRES_PER_METRE
}

/// From/to distance pair along the source route a segment was cut from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasureRange {
    pub from: f64,
    pub to: f64,
}

impl MeasureRange {
    pub fn new(from: f64, to: f64) -> Self {
        Self { from, to }
    }

    /// Split the range `first_length` metres after its start.
    /// The split distance is rounded to the millimetre.
    pub fn split_at(&self, first_length: f64) -> (MeasureRange, MeasureRange) {
        let split = round_mm(self.from + first_length);
        (
            MeasureRange::new(self.from, split),
            MeasureRange::new(split, self.to),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub id: i64,
    pub blue_line_key: Option<i32>,
    pub watershed_code: String,
    pub local_watershed_code: Option<String>,
    /// Metres. Rounded to the millimetre when the edge is created.
    pub length: f64,
    pub from_point: Option<Coord>,
    pub to_point: Option<Coord>,
    /// Interior vertices between `from_point` and `to_point`, if known.
    #[serde(default)]
    pub vertices: Vec<Coord>,
    /// Set by the tiling step: the segment lies entirely inside its tile.
    #[serde(default)]
    pub contained: Option<bool>,
    /// Set by the tiling step: the segment touches its tile at all.
    #[serde(default)]
    pub intersects: Option<bool>,
    #[serde(default)]
    pub stream_order: Option<i32>,
    #[serde(default)]
    pub measure: Option<MeasureRange>,
}

impl SegmentRecord {
    /// Minimal record with a straight line between two points.
    pub fn new(
        id: i64,
        blue_line_key: Option<i32>,
        watershed_code: impl Into<String>,
        length: f64,
        from_point: Coord,
        to_point: Coord,
    ) -> Self {
        Self {
            id,
            blue_line_key,
            watershed_code: watershed_code.into(),
            local_watershed_code: None,
            length,
            from_point: Some(from_point),
            to_point: Some(to_point),
            vertices: Vec::new(),
            contained: None,
            intersects: None,
            stream_order: None,
            measure: None,
        }
    }

    pub fn with_local_watershed_code(mut self, code: impl Into<String>) -> Self {
        self.local_watershed_code = Some(code.into());
        self
    }

    pub fn with_vertices(mut self, vertices: Vec<Coord>) -> Self {
        self.vertices = vertices;
        self
    }

    pub fn with_contained(mut self, contained: bool) -> Self {
        self.contained = Some(contained);
        self
    }

    pub fn with_measure(mut self, measure: MeasureRange) -> Self {
        self.measure = Some(measure);
        self
    }
}
