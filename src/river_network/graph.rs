// ===========================================================================
// Directed river graph (arena-backed, matches the record graph of the loader)
// ===========================================================================
//
// Nodes are keyed by endpoint coordinates snapped to a fixed grid, so two
// segments that share a rounded endpoint always meet at the same node. Nodes
// and edges live in arenas owned by `RiverGraph` and refer to each other by
// index. Removed edges leave a hole in the arena; nodes are never removed.

use ahash::AHashMap;
use geo::{Coord, EuclideanLength, LineString};
use std::fmt;
use thiserror::Error;

use super::record::{round_mm, MeasureRange, SegmentRecord, DEFAULT_LOCAL_WATERSHED_CODE};
use super::route_path::RoutePath;

/// Default snapping grid: 10 000 cells per metre (0.1 mm).
pub const DEFAULT_NODE_PRECISION: f64 = 10_000.0;

#[derive(Error, Debug, PartialEq)]
pub enum GraphError {
    #[error("Segment {0} has no from point")]
    MissingFromPoint(i64),
    #[error("Segment {0} has no to point")]
    MissingToPoint(i64),
    #[error("Segment {id} has a non-finite coordinate {coord:?}")]
    NonFiniteCoordinate { id: i64, coord: Coord },
    #[error("Segment {id} has an invalid length {length}")]
    InvalidLength { id: i64, length: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeIdx(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeIdx(pub u32);

impl NodeIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl EdgeIdx {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for EdgeIdx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Snapped grid cell a coordinate falls in.
pub type NodeKey = (i64, i64);

#[derive(Debug, Clone)]
pub struct Node {
    pub idx: NodeIdx,
    pub key: NodeKey,
    /// Grid-snapped position.
    pub coord: Coord,
    out_edges: Vec<EdgeIdx>,
    in_edges: Vec<EdgeIdx>,
}

impl Node {
    pub fn out_edges(&self) -> &[EdgeIdx] {
        &self.out_edges
    }

    pub fn in_edges(&self) -> &[EdgeIdx] {
        &self.in_edges
    }

    pub fn degree(&self) -> usize {
        self.out_edges.len() + self.in_edges.len()
    }

    /// Network exit: nothing flows in.
    pub fn is_outlet(&self) -> bool {
        self.in_edges.is_empty()
    }

    pub fn is_headwater(&self) -> bool {
        self.out_edges.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub idx: EdgeIdx,
    /// Stable linear feature id from the source record.
    pub id: i64,
    pub blue_line_key: Option<i32>,
    pub watershed_code: String,
    pub local_watershed_code: String,
    pub min_local_watershed_code: String,
    pub max_local_watershed_code: String,
    /// Metres, millimetre precision.
    pub length: f64,
    pub downstream_length: f64,
    pub upstream_length: f64,
    pub from: NodeIdx,
    pub to: NodeIdx,
    pub line: LineString<f64>,
    pub contained: bool,
    pub intersects: bool,
    pub stream_order: i32,
    pub measure: Option<MeasureRange>,
    routes: Vec<RoutePath>,
}

impl Edge {
    pub fn is_loop(&self) -> bool {
        self.from == self.to
    }

    pub fn routes(&self) -> &[RoutePath] {
        &self.routes
    }

    /// Store `route` unless an already stored route is a prefix of it.
    pub fn add_route(&mut self, route: RoutePath) -> bool {
        if self.routes.iter().any(|existing| route.starts_with(existing)) {
            return false;
        }
        self.routes.push(route);
        true
    }

    pub fn clear_routes(&mut self) {
        self.routes.clear();
    }

    /// Geometric length of the edge's line, rounded to the millimetre.
    pub fn line_length(&self) -> f64 {
        #[allow(deprecated)]
        let length = self.line.euclidean_length();
        round_mm(length)
    }

    pub(crate) fn from_record(record: &SegmentRecord) -> Result<Edge, GraphError> {
        let from = record
            .from_point
            .ok_or(GraphError::MissingFromPoint(record.id))?;
        let to = record.to_point.ok_or(GraphError::MissingToPoint(record.id))?;
        for coord in std::iter::once(&from)
            .chain(record.vertices.iter())
            .chain(std::iter::once(&to))
        {
            if !coord.x.is_finite() || !coord.y.is_finite() {
                return Err(GraphError::NonFiniteCoordinate {
                    id: record.id,
                    coord: *coord,
                });
            }
        }
        if !record.length.is_finite() || record.length < 0.0 {
            return Err(GraphError::InvalidLength {
                id: record.id,
                length: record.length,
            });
        }

        let mut coords = Vec::with_capacity(record.vertices.len() + 2);
        coords.push(from);
        coords.extend(record.vertices.iter().copied());
        coords.push(to);

        let local = record
            .local_watershed_code
            .clone()
            .unwrap_or_else(|| DEFAULT_LOCAL_WATERSHED_CODE.to_string());

        Ok(Edge {
            idx: EdgeIdx(u32::MAX),
            id: record.id,
            blue_line_key: record.blue_line_key,
            watershed_code: record.watershed_code.clone(),
            min_local_watershed_code: local.clone(),
            max_local_watershed_code: local.clone(),
            local_watershed_code: local,
            length: round_mm(record.length),
            downstream_length: 0.0,
            upstream_length: 0.0,
            from: NodeIdx(u32::MAX),
            to: NodeIdx(u32::MAX),
            line: LineString::new(coords),
            contained: record.contained.unwrap_or(true),
            intersects: record.intersects.unwrap_or(true),
            stream_order: record.stream_order.unwrap_or(0),
            measure: record.measure,
            routes: Vec::new(),
        })
    }

    /// Copy of this edge's attributes on a new line, with results reset.
    pub(crate) fn derive(&self, line: LineString<f64>, length: f64) -> Edge {
        Edge {
            idx: EdgeIdx(u32::MAX),
            id: self.id,
            blue_line_key: self.blue_line_key,
            watershed_code: self.watershed_code.clone(),
            local_watershed_code: self.local_watershed_code.clone(),
            min_local_watershed_code: self.min_local_watershed_code.clone(),
            max_local_watershed_code: self.max_local_watershed_code.clone(),
            length,
            downstream_length: 0.0,
            upstream_length: 0.0,
            from: NodeIdx(u32::MAX),
            to: NodeIdx(u32::MAX),
            line,
            contained: self.contained,
            intersects: self.intersects,
            stream_order: self.stream_order,
            measure: self.measure,
            routes: Vec::new(),
        }
    }
}

pub struct RiverGraph {
    nodes: Vec<Node>,
    edges: Vec<Option<Edge>>,
    node_keys: AHashMap<NodeKey, NodeIdx>,
    precision: f64,
    live_edges: usize,
}

impl Default for RiverGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl RiverGraph {
    pub fn new() -> Self {
        Self::with_precision(DEFAULT_NODE_PRECISION)
    }

    /// `precision` is the number of grid cells per coordinate unit.
    pub fn with_precision(precision: f64) -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            node_keys: AHashMap::new(),
            precision,
            live_edges: 0,
        }
    }

    pub fn precision(&self) -> f64 {
        self.precision
    }

    /// Size of one grid cell in coordinate units.
    pub fn tolerance(&self) -> f64 {
        1.0 / self.precision
    }

    pub fn node_key(&self, coord: Coord) -> NodeKey {
        (
            (coord.x * self.precision).round() as i64,
            (coord.y * self.precision).round() as i64,
        )
    }

    pub fn node_at(&self, coord: Coord) -> Option<NodeIdx> {
        self.node_keys.get(&self.node_key(coord)).copied()
    }

    /// Resolve the node for `coord`, creating it on first sight.
    pub fn get_or_add_node(&mut self, coord: Coord) -> NodeIdx {
        let key = self.node_key(coord);
        if let Some(&idx) = self.node_keys.get(&key) {
            return idx;
        }
        let idx = NodeIdx(self.nodes.len() as u32);
        self.nodes.push(Node {
            idx,
            key,
            coord: Coord {
                x: key.0 as f64 / self.precision,
                y: key.1 as f64 / self.precision,
            },
            out_edges: Vec::new(),
            in_edges: Vec::new(),
        });
        self.node_keys.insert(key, idx);
        idx
    }

    pub fn add_edge(&mut self, record: &SegmentRecord) -> Result<EdgeIdx, GraphError> {
        let edge = Edge::from_record(record)?;
        let (from, to) = (edge.line.0[0], edge.line.0[edge.line.0.len() - 1]);
        Ok(self.insert_edge(edge, from, to))
    }

    /// Register an edge between the nodes at `from` and `to`.
    pub(crate) fn insert_edge(&mut self, mut edge: Edge, from: Coord, to: Coord) -> EdgeIdx {
        let from = self.get_or_add_node(from);
        let to = self.get_or_add_node(to);
        let idx = EdgeIdx(self.edges.len() as u32);

        edge.idx = idx;
        edge.from = from;
        edge.to = to;
        self.edges.push(Some(edge));
        self.nodes[from.index()].out_edges.push(idx);
        self.nodes[to.index()].in_edges.push(idx);
        self.live_edges += 1;
        idx
    }

    /// Detach an edge from both of its nodes. The nodes stay in the graph.
    pub fn remove_edge(&mut self, idx: EdgeIdx) -> Option<Edge> {
        let edge = self.edges.get_mut(idx.index())?.take()?;
        self.nodes[edge.from.index()].out_edges.retain(|&e| e != idx);
        self.nodes[edge.to.index()].in_edges.retain(|&e| e != idx);
        self.live_edges -= 1;
        Some(edge)
    }

    pub fn node(&self, idx: NodeIdx) -> &Node {
        &self.nodes[idx.index()]
    }

    pub fn edge(&self, idx: EdgeIdx) -> Option<&Edge> {
        self.edges.get(idx.index()).and_then(|e| e.as_ref())
    }

    pub fn edge_mut(&mut self, idx: EdgeIdx) -> Option<&mut Edge> {
        self.edges.get_mut(idx.index()).and_then(|e| e.as_mut())
    }

    pub fn out_edges(&self, node: NodeIdx) -> &[EdgeIdx] {
        &self.nodes[node.index()].out_edges
    }

    pub fn in_edges(&self, node: NodeIdx) -> &[EdgeIdx] {
        &self.nodes[node.index()].in_edges
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of live (not removed) edges.
    pub fn edge_count(&self) -> usize {
        self.live_edges
    }

    /// Upper bound of edge indices, removed slots included.
    pub fn edge_capacity(&self) -> usize {
        self.edges.len()
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Live edges in insertion order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter_map(|e| e.as_ref())
    }

    pub fn edges_mut(&mut self) -> impl Iterator<Item = &mut Edge> {
        self.edges.iter_mut().filter_map(|e| e.as_mut())
    }

    pub fn node_indices(&self) -> Vec<NodeIdx> {
        (0..self.nodes.len() as u32).map(NodeIdx).collect()
    }

    pub fn edge_indices(&self) -> Vec<EdgeIdx> {
        self.edges().map(|e| e.idx).collect()
    }

    pub fn for_each_node(&self, mut f: impl FnMut(&Node)) {
        self.nodes.iter().for_each(|n| f(n));
    }

    pub fn for_each_edge(&self, mut f: impl FnMut(&Edge)) {
        self.edges().for_each(|e| f(e));
    }

    pub fn outlets(&self) -> impl Iterator<Item = NodeIdx> + '_ {
        self.nodes.iter().filter(|n| n.is_outlet()).map(|n| n.idx)
    }

    /// Live edge carrying linear feature id `id`, first match in insertion order.
    pub fn find_edge_by_id(&self, id: i64) -> Option<&Edge> {
        self.edges().find(|e| e.id == id)
    }
}
