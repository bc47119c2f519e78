// ===========================================================================
// Topology maintenance: edge split and pass-through merge
// ===========================================================================
//
// Neither operation errors. When an operation does not apply the caller gets
// the reason back and the graph is left exactly as it was.

use geo::{BoundingRect, Coord, LineString};
use log::{debug, info, trace};
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::RTree;

use super::graph::{Edge, EdgeIdx, NodeIdx, RiverGraph};
use super::record::MeasureRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitRejection {
    UnknownEdge,
    /// The node is one of the edge's own endpoints.
    EndpointNode,
    /// The node does not lie on the edge's line.
    NotOnLine,
    /// One of the pieces would have no length.
    Degenerate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitOutcome {
    Split([EdgeIdx; 2]),
    NotApplicable(SplitRejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Incompatibility {
    WatershedCode,
    BlueLineKey,
    NotContained,
    LocalWatershedCodeLength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRejection {
    UnknownEdge,
    /// The node does not have exactly one edge in and one edge out.
    NotPassThrough,
    /// The two edges do not meet head to tail at the node.
    NotEndToEnd,
    Incompatible(Incompatibility),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Merged(EdgeIdx),
    NotApplicable(MergeRejection),
}

// ---------------------------------------------------------------------------
// Split
// ---------------------------------------------------------------------------

/// Break `edge` in two at `at_node`, which must lie strictly inside the line.
///
/// Each piece gets its geometric length; a routing measure on the edge is
/// divided at `from + length(first piece)`. The split edge is removed.
pub fn split_edge(graph: &mut RiverGraph, edge_idx: EdgeIdx, at_node: NodeIdx) -> SplitOutcome {
    let tolerance = graph.tolerance();
    let split_at = graph.node(at_node).coord;

    let Some(edge) = graph.edge(edge_idx) else {
        return SplitOutcome::NotApplicable(SplitRejection::UnknownEdge);
    };
    if edge.from == at_node || edge.to == at_node {
        return SplitOutcome::NotApplicable(SplitRejection::EndpointNode);
    }
    let Some(segment) = locate_on_line(&edge.line, split_at, tolerance) else {
        return SplitOutcome::NotApplicable(SplitRejection::NotOnLine);
    };

    let coords = &edge.line.0;
    let mut first: Vec<Coord> = Vec::with_capacity(segment + 2);
    for &c in &coords[..=segment] {
        push_distinct(&mut first, c, tolerance);
    }
    replace_or_push(&mut first, split_at, tolerance);

    let mut second: Vec<Coord> = Vec::with_capacity(coords.len() - segment + 1);
    second.push(split_at);
    for &c in &coords[segment + 1..] {
        push_distinct(&mut second, c, tolerance);
    }
    if first.len() < 2 || second.len() < 2 {
        return SplitOutcome::NotApplicable(SplitRejection::Degenerate);
    }

    let start = graph.node(edge.from).coord;
    let end = graph.node(edge.to).coord;

    let mut piece1 = edge.derive(LineString::new(first), 0.0);
    let mut piece2 = edge.derive(LineString::new(second), 0.0);
    piece1.length = piece1.line_length();
    piece2.length = piece2.line_length();
    if piece1.length <= 0.0 || piece2.length <= 0.0 {
        return SplitOutcome::NotApplicable(SplitRejection::Degenerate);
    }
    if let Some(measure) = edge.measure {
        let (m1, m2) = measure.split_at(piece1.length);
        piece1.measure = Some(m1);
        piece2.measure = Some(m2);
    }
    trace!(
        "Split edge {} ({}) at {}: {} + {}",
        edge.id, edge_idx, at_node, piece1.length, piece2.length
    );

    graph.remove_edge(edge_idx);
    let first_idx = graph.insert_edge(piece1, start, split_at);
    let second_idx = graph.insert_edge(piece2, split_at, end);
    SplitOutcome::Split([first_idx, second_idx])
}

/// Index of the first segment of `line` passing within `tolerance` of `point`.
fn locate_on_line(line: &LineString<f64>, point: Coord, tolerance: f64) -> Option<usize> {
    line.0.windows(2).position(|pair| {
        let (a, b) = (pair[0], pair[1]);
        let dx = b.x - a.x;
        let dy = b.y - a.y;
        let len2 = dx * dx + dy * dy;
        let t = if len2 == 0.0 {
            0.0
        } else {
            (((point.x - a.x) * dx + (point.y - a.y) * dy) / len2).clamp(0.0, 1.0)
        };
        let px = a.x + t * dx - point.x;
        let py = a.y + t * dy - point.y;
        px.hypot(py) <= tolerance
    })
}

fn near(a: Coord, b: Coord, tolerance: f64) -> bool {
    (a.x - b.x).hypot(a.y - b.y) <= tolerance
}

fn push_distinct(coords: &mut Vec<Coord>, c: Coord, tolerance: f64) {
    if coords.last().is_none_or(|&last| !near(last, c, tolerance)) {
        coords.push(c);
    }
}

fn replace_or_push(coords: &mut Vec<Coord>, c: Coord, tolerance: f64) {
    let len = coords.len();
    match coords.last_mut() {
        Some(last) if len > 1 && near(*last, c, tolerance) => *last = c,
        _ => coords.push(c),
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Whether two edges meeting at a pass-through node may become one edge.
pub fn merge_compatibility(a: &Edge, b: &Edge) -> Result<(), Incompatibility> {
    if a.watershed_code != b.watershed_code {
        return Err(Incompatibility::WatershedCode);
    }
    if a.blue_line_key != b.blue_line_key {
        return Err(Incompatibility::BlueLineKey);
    }
    if !(a.contained && b.contained) {
        return Err(Incompatibility::NotContained);
    }
    if a.min_local_watershed_code.len() != b.min_local_watershed_code.len()
        || a.max_local_watershed_code.len() != b.max_local_watershed_code.len()
    {
        return Err(Incompatibility::LocalWatershedCodeLength);
    }
    Ok(())
}

/// Collapse `node` by joining the edge flowing into it with the edge flowing
/// out of it. The arguments may be given in either order.
///
/// The merged edge takes the smaller linear feature id, the min/max local
/// watershed codes of the pair, the summed length and the *smaller* of each
/// downstream/upstream length. Those last two are only good enough for
/// reduced-detail rendering; rerun length propagation for exact values.
pub fn merge_at(
    graph: &mut RiverGraph,
    node: NodeIdx,
    edge1: EdgeIdx,
    edge2: EdgeIdx,
) -> MergeOutcome {
    let (Some(a), Some(b)) = (graph.edge(edge1), graph.edge(edge2)) else {
        return MergeOutcome::NotApplicable(MergeRejection::UnknownEdge);
    };
    let n = graph.node(node);
    if edge1 == edge2
        || a.is_loop()
        || b.is_loop()
        || n.in_edges().len() != 1
        || n.out_edges().len() != 1
    {
        return MergeOutcome::NotApplicable(MergeRejection::NotPassThrough);
    }
    let (first, second) = if a.to == node && b.from == node {
        (a, b)
    } else if b.to == node && a.from == node {
        (b, a)
    } else {
        return MergeOutcome::NotApplicable(MergeRejection::NotEndToEnd);
    };
    if let Err(reason) = merge_compatibility(first, second) {
        return MergeOutcome::NotApplicable(MergeRejection::Incompatible(reason));
    }

    let mut coords = first.line.0.clone();
    coords.extend(second.line.0.iter().skip(1).copied());

    let mut merged = first.derive(LineString::new(coords), first.length + second.length);
    merged.id = first.id.min(second.id);
    merged.min_local_watershed_code = first
        .min_local_watershed_code
        .clone()
        .min(second.min_local_watershed_code.clone());
    merged.max_local_watershed_code = first
        .max_local_watershed_code
        .clone()
        .max(second.max_local_watershed_code.clone());
    merged.local_watershed_code = merged.min_local_watershed_code.clone();
    merged.downstream_length = first.downstream_length.min(second.downstream_length);
    merged.upstream_length = first.upstream_length.min(second.upstream_length);
    merged.intersects = first.intersects || second.intersects;
    merged.measure = match (first.measure, second.measure) {
        (Some(m1), Some(m2)) => Some(MeasureRange::new(m1.from, m2.to)),
        _ => None,
    };

    let (first_idx, second_idx) = (first.idx, second.idx);
    let start = graph.node(first.from).coord;
    let end = graph.node(second.to).coord;

    graph.remove_edge(first_idx);
    graph.remove_edge(second_idx);
    MergeOutcome::Merged(graph.insert_edge(merged, start, end))
}

// ---------------------------------------------------------------------------
// Bulk passes
// ---------------------------------------------------------------------------

type EdgeEnvelope = GeomWithData<Rectangle<[f64; 2]>, EdgeIdx>;

fn envelope(edge: &Edge, tolerance: f64) -> Option<EdgeEnvelope> {
    let rect = edge.line.bounding_rect()?;
    let aabb = Rectangle::from_corners(
        [rect.min().x - tolerance, rect.min().y - tolerance],
        [rect.max().x + tolerance, rect.max().y + tolerance],
    );
    Some(GeomWithData::new(aabb, edge.idx))
}

/// Split every edge at every node lying in the interior of its line.
/// Returns the number of splits performed.
pub fn split_edges_at_nodes(graph: &mut RiverGraph) -> usize {
    let tolerance = graph.tolerance();
    let mut tree: RTree<EdgeEnvelope> =
        RTree::bulk_load(graph.edges().filter_map(|e| envelope(e, tolerance)).collect());

    let mut splits = 0;
    for node in graph.node_indices() {
        let coord = graph.node(node).coord;
        let candidates: Vec<EdgeEnvelope> = tree
            .locate_all_at_point(&[coord.x, coord.y])
            .cloned()
            .collect();

        for candidate in candidates {
            let SplitOutcome::Split(pieces) = split_edge(graph, candidate.data, node) else {
                continue;
            };
            tree.remove(&candidate);
            for piece in pieces {
                if let Some(item) = graph.edge(piece).and_then(|e| envelope(e, tolerance)) {
                    tree.insert(item);
                }
            }
            splits += 1;
        }
    }
    info!("Split edges at nodes\t{}", splits);
    splits
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    pub candidates: usize,
    pub merged: usize,
}

/// Merge across every node with exactly one edge in and one edge out.
pub fn merge_pass_through_nodes(graph: &mut RiverGraph) -> MergeStats {
    let mut stats = MergeStats::default();
    for node in graph.node_indices() {
        let n = graph.node(node);
        let (&[incoming], &[outgoing]) = (n.in_edges(), n.out_edges()) else {
            continue;
        };
        if incoming == outgoing {
            continue;
        }
        stats.candidates += 1;
        match merge_at(graph, node, incoming, outgoing) {
            MergeOutcome::Merged(_) => stats.merged += 1,
            MergeOutcome::NotApplicable(reason) => {
                debug!("Not merging at {}: {:?}", node, reason);
            }
        }
    }
    info!(
        "Merged pass-through nodes\t{}\t{}",
        stats.candidates, stats.merged
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::river_network::record::SegmentRecord;

    fn c(x: f64, y: f64) -> Coord {
        Coord { x, y }
    }

    fn straight(graph: &mut RiverGraph, id: i64, from: Coord, to: Coord) -> EdgeIdx {
        let length = (to.x - from.x).hypot(to.y - from.y);
        graph
            .add_edge(
                &SegmentRecord::new(id, Some(7), "100-200", length, from, to)
                    .with_local_watershed_code("100-200-300"),
            )
            .unwrap()
    }

    #[test]
    fn test_split_at_interior_node() {
        let mut graph = RiverGraph::new();
        let edge = graph
            .add_edge(
                &SegmentRecord::new(1, Some(7), "100", 10.0, c(0.0, 0.0), c(10.0, 0.0))
                    .with_measure(MeasureRange::new(250.0, 260.0)),
            )
            .unwrap();
        let at = graph.get_or_add_node(c(4.0, 0.0));

        let SplitOutcome::Split([a, b]) = split_edge(&mut graph, edge, at) else {
            panic!("expected a split");
        };
        let (a, b) = (graph.edge(a).unwrap(), graph.edge(b).unwrap());
        assert_eq!(a.length, 4.0);
        assert_eq!(b.length, 6.0);
        assert_eq!(a.to, at);
        assert_eq!(b.from, at);
        assert_eq!(a.id, 1);
        assert_eq!(a.measure, Some(MeasureRange::new(250.0, 254.0)));
        assert_eq!(b.measure, Some(MeasureRange::new(254.0, 260.0)));
        assert!(graph.edge(edge).is_none());
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn test_split_conserves_length_on_polyline() {
        let mut graph = RiverGraph::new();
        let edge = graph
            .add_edge(
                &SegmentRecord::new(1, None, "100", 7.0, c(0.0, 0.0), c(3.0, 4.0))
                    .with_vertices(vec![c(3.0, 0.0)]),
            )
            .unwrap();
        let at = graph.get_or_add_node(c(3.0, 1.337));
        let SplitOutcome::Split([a, b]) = split_edge(&mut graph, edge, at) else {
            panic!("expected a split");
        };
        let total = graph.edge(a).unwrap().length + graph.edge(b).unwrap().length;
        assert!((total - 7.0).abs() <= 0.001);
        assert_eq!(graph.edge(a).unwrap().line.0.len(), 3);
        assert_eq!(graph.edge(b).unwrap().line.0.len(), 2);
    }

    #[test]
    fn test_split_at_vertex_does_not_duplicate_points() {
        let mut graph = RiverGraph::new();
        let edge = graph
            .add_edge(
                &SegmentRecord::new(1, None, "100", 7.0, c(0.0, 0.0), c(3.0, 4.0))
                    .with_vertices(vec![c(3.0, 0.0)]),
            )
            .unwrap();
        let at = graph.get_or_add_node(c(3.0, 0.0));
        let SplitOutcome::Split([a, b]) = split_edge(&mut graph, edge, at) else {
            panic!("expected a split");
        };
        assert_eq!(graph.edge(a).unwrap().line.0, vec![c(0.0, 0.0), c(3.0, 0.0)]);
        assert_eq!(graph.edge(b).unwrap().line.0, vec![c(3.0, 0.0), c(3.0, 4.0)]);
    }

    #[test]
    fn test_split_rejections_leave_graph_untouched() {
        let mut graph = RiverGraph::new();
        let edge = straight(&mut graph, 1, c(0.0, 0.0), c(10.0, 0.0));
        let start = graph.edge(edge).unwrap().from;
        let off_line = graph.get_or_add_node(c(4.0, 1.0));

        assert_eq!(
            split_edge(&mut graph, edge, start),
            SplitOutcome::NotApplicable(SplitRejection::EndpointNode)
        );
        assert_eq!(
            split_edge(&mut graph, edge, off_line),
            SplitOutcome::NotApplicable(SplitRejection::NotOnLine)
        );
        assert_eq!(
            split_edge(&mut graph, EdgeIdx(99), off_line),
            SplitOutcome::NotApplicable(SplitRejection::UnknownEdge)
        );
        assert_eq!(graph.edge_count(), 1);
        assert!(graph.edge(edge).is_some());
    }

    #[test]
    fn test_split_next_to_endpoint_is_degenerate() {
        let mut graph = RiverGraph::new();
        let edge = straight(&mut graph, 1, c(0.0, 0.0), c(10.0, 0.0));
        let near_start = graph.get_or_add_node(c(0.0001, 0.0));
        let near_end = graph.get_or_add_node(c(9.9999, 0.0));

        for node in [near_start, near_end] {
            assert_eq!(
                split_edge(&mut graph, edge, node),
                SplitOutcome::NotApplicable(SplitRejection::Degenerate)
            );
        }
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.edge(edge).unwrap().length, 10.0);
    }

    #[test]
    fn test_merge_at_pass_through_node() {
        let mut graph = RiverGraph::new();
        let a = straight(&mut graph, 20, c(0.0, 0.0), c(4.0, 0.0));
        let b = straight(&mut graph, 10, c(4.0, 0.0), c(10.0, 0.0));
        graph.edge_mut(a).unwrap().downstream_length = 5.0;
        graph.edge_mut(b).unwrap().downstream_length = 9.0;
        graph.edge_mut(b).unwrap().max_local_watershed_code = "100-200-301".to_string();
        let node = graph.edge(a).unwrap().to;

        // Arguments in reverse order still merge head to tail.
        let MergeOutcome::Merged(merged) = merge_at(&mut graph, node, b, a) else {
            panic!("expected a merge");
        };
        let merged = graph.edge(merged).unwrap();
        assert_eq!(merged.length, 10.0);
        assert_eq!(merged.id, 10);
        assert_eq!(merged.downstream_length, 5.0);
        assert_eq!(merged.min_local_watershed_code, "100-200-300");
        assert_eq!(merged.max_local_watershed_code, "100-200-301");
        assert_eq!(merged.line.0, vec![c(0.0, 0.0), c(4.0, 0.0), c(10.0, 0.0)]);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.node(node).degree(), 0);
    }

    #[test]
    fn test_merge_rejects_incompatible_pairs() {
        let mut graph = RiverGraph::new();
        let a = straight(&mut graph, 1, c(0.0, 0.0), c(4.0, 0.0));
        let b = straight(&mut graph, 2, c(4.0, 0.0), c(10.0, 0.0));
        let node = graph.edge(a).unwrap().to;

        graph.edge_mut(b).unwrap().blue_line_key = Some(8);
        assert_eq!(
            merge_at(&mut graph, node, a, b),
            MergeOutcome::NotApplicable(MergeRejection::Incompatible(
                Incompatibility::BlueLineKey
            ))
        );

        graph.edge_mut(b).unwrap().blue_line_key = Some(7);
        graph.edge_mut(a).unwrap().contained = false;
        assert_eq!(
            merge_at(&mut graph, node, a, b),
            MergeOutcome::NotApplicable(MergeRejection::Incompatible(
                Incompatibility::NotContained
            ))
        );

        graph.edge_mut(a).unwrap().contained = true;
        graph.edge_mut(a).unwrap().min_local_watershed_code = "100".to_string();
        assert_eq!(
            merge_at(&mut graph, node, a, b),
            MergeOutcome::NotApplicable(MergeRejection::Incompatible(
                Incompatibility::LocalWatershedCodeLength
            ))
        );
        assert_eq!(graph.edge_count(), 2);
    }

    #[test]
    fn test_merge_rejects_confluence() {
        let mut graph = RiverGraph::new();
        let a = straight(&mut graph, 1, c(0.0, 0.0), c(4.0, 0.0));
        let b = straight(&mut graph, 2, c(4.0, 0.0), c(10.0, 0.0));
        straight(&mut graph, 3, c(4.0, 0.0), c(4.0, 5.0));
        let node = graph.edge(a).unwrap().to;
        assert_eq!(
            merge_at(&mut graph, node, a, b),
            MergeOutcome::NotApplicable(MergeRejection::NotPassThrough)
        );
    }

    #[test]
    fn test_split_edges_at_nodes_splits_every_crossing() {
        let mut graph = RiverGraph::new();
        let main = straight(&mut graph, 1, c(0.0, 0.0), c(10.0, 0.0));
        straight(&mut graph, 2, c(3.0, 0.0), c(3.0, 5.0));
        straight(&mut graph, 3, c(7.0, 0.0), c(7.0, 5.0));

        assert_eq!(split_edges_at_nodes(&mut graph), 2);
        assert!(graph.edge(main).is_none());
        assert_eq!(graph.edge_count(), 5);

        let mut main_lengths: Vec<f64> = graph
            .edges()
            .filter_map(|e| (e.id == 1).then_some(e.length))
            .collect();
        main_lengths.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(main_lengths, vec![3.0, 3.0, 4.0]);
    }

    #[test]
    fn test_merge_pass_through_nodes_collapses_chain() {
        let mut graph = RiverGraph::new();
        straight(&mut graph, 3, c(0.0, 0.0), c(1.0, 0.0));
        straight(&mut graph, 2, c(1.0, 0.0), c(2.0, 0.0));
        straight(&mut graph, 1, c(2.0, 0.0), c(3.0, 0.0));

        let stats = merge_pass_through_nodes(&mut graph);
        assert_eq!(stats.merged, 2);
        assert_eq!(graph.edge_count(), 1);
        let edge = graph.edges().next().unwrap();
        assert_eq!(edge.id, 1);
        assert_eq!(edge.length, 3.0);
    }
}
