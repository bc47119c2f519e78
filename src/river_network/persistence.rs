// ===========================================================================
// Result export: diff against the stored snapshot, hand updates to a sink
// ===========================================================================
//
// Only segments whose lengths or routes differ from what is already stored
// are emitted, so re-running the passes on an unchanged network writes
// nothing. A segment split into several edges is reported once: routes are
// the shortest ones over its pieces, lengths the minimum over its pieces.

use ahash::{AHashMap, AHashSet};
use anyhow::Context;
use log::info;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::BTreeMap;
use std::io::Write;

use super::graph::RiverGraph;
use super::record::to_mm;
use super::route_path::{RoutePath, RoutePathError};

const FLUSH_PROGRESS_INTERVAL: usize = 50_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredSegment {
    pub downstream_length: f64,
    pub upstream_length: f64,
    #[serde(default)]
    pub routes: Vec<ByteBuf>,
}

impl StoredSegment {
    fn same_lengths(&self, other: &StoredSegment) -> bool {
        to_mm(self.downstream_length) == to_mm(other.downstream_length)
            && to_mm(self.upstream_length) == to_mm(other.upstream_length)
    }
}

/// What the store currently holds, by segment id. Missing ids count as
/// zero lengths and no routes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredSnapshot {
    segments: AHashMap<i64, StoredSegment>,
}

impl StoredSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: i64, segment: StoredSegment) {
        self.segments.insert(id, segment);
    }

    pub fn get(&self, id: i64) -> Option<&StoredSegment> {
        self.segments.get(&id)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Snapshot of the values the graph would persist right now.
    pub fn capture(graph: &RiverGraph, excluded_ids: &AHashSet<i64>) -> Result<Self, RoutePathError> {
        Ok(Self {
            segments: current_segments(graph, excluded_ids)?.into_iter().collect(),
        })
    }

    /// Record updates as written.
    pub fn apply(&mut self, updates: &[SegmentUpdate]) {
        for update in updates {
            let stored = self.segments.entry(update.id).or_default();
            if let Some(lengths) = update.lengths {
                stored.downstream_length = lengths.downstream_length;
                stored.upstream_length = lengths.upstream_length;
            }
            if let Some(routes) = &update.routes {
                stored.routes = routes.clone();
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LengthUpdate {
    pub downstream_length: f64,
    pub upstream_length: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentUpdate {
    pub id: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lengths: Option<LengthUpdate>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub routes: Option<Vec<ByteBuf>>,
}

/// Serialize a segment's routes in canonical order, each round-trip checked.
///
/// Routes extending another route of the same segment are dropped, so the
/// pieces of a split segment persist only their shortest routes.
pub fn encode_routes<'a>(
    routes: impl IntoIterator<Item = &'a RoutePath>,
) -> Result<Vec<ByteBuf>, RoutePathError> {
    let mut sorted: Vec<&RoutePath> = routes.into_iter().collect();
    sorted.sort();

    // A prefix always sorts before its extensions.
    let mut minimal: Vec<&RoutePath> = Vec::with_capacity(sorted.len());
    for route in sorted {
        if !minimal.iter().any(|kept| route.starts_with(kept)) {
            minimal.push(route);
        }
    }
    minimal
        .into_iter()
        .map(|r| r.to_verified_bytes().map(ByteBuf::from))
        .collect()
}

fn current_segments(
    graph: &RiverGraph,
    excluded_ids: &AHashSet<i64>,
) -> Result<BTreeMap<i64, StoredSegment>, RoutePathError> {
    let mut by_id: BTreeMap<i64, (f64, f64, Vec<&RoutePath>)> = BTreeMap::new();
    for edge in graph.edges() {
        let entry = by_id.entry(edge.id).or_insert((
            edge.downstream_length,
            edge.upstream_length,
            Vec::new(),
        ));
        entry.0 = entry.0.min(edge.downstream_length);
        entry.1 = entry.1.min(edge.upstream_length);
        entry.2.extend(edge.routes());
    }

    let mut segments = BTreeMap::new();
    for (id, (downstream_length, upstream_length, routes)) in by_id {
        segments.insert(
            id,
            StoredSegment {
                downstream_length,
                upstream_length,
                routes: encode_routes(routes)?,
            },
        );
    }
    for &id in excluded_ids {
        segments.entry(id).or_default();
    }
    Ok(segments)
}

/// Per-segment updates needed to bring `snapshot` in line with `graph`,
/// ordered by segment id.
///
/// Excluded segments are reported with both lengths zero. Fails if any
/// route does not survive serialization; nothing should be written then.
pub fn diff_updates(
    graph: &RiverGraph,
    excluded_ids: &AHashSet<i64>,
    snapshot: &StoredSnapshot,
) -> Result<Vec<SegmentUpdate>, RoutePathError> {
    let empty = StoredSegment::default();
    let mut updates = Vec::new();

    for (id, current) in current_segments(graph, excluded_ids)? {
        let stored = snapshot.get(id).unwrap_or(&empty);
        let lengths = (!current.same_lengths(stored)).then_some(LengthUpdate {
            downstream_length: current.downstream_length,
            upstream_length: current.upstream_length,
        });
        let routes = (current.routes != stored.routes).then_some(current.routes);

        if lengths.is_some() || routes.is_some() {
            updates.push(SegmentUpdate {
                id,
                lengths,
                routes,
            });
        }
    }
    Ok(updates)
}

/// Destination for segment updates, e.g. a database writer.
pub trait SegmentSink {
    fn write(&mut self, update: &SegmentUpdate) -> anyhow::Result<()>;

    fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Collects updates in memory.
#[derive(Debug, Default)]
pub struct VecSink {
    pub updates: Vec<SegmentUpdate>,
}

impl SegmentSink for VecSink {
    fn write(&mut self, update: &SegmentUpdate) -> anyhow::Result<()> {
        self.updates.push(update.clone());
        Ok(())
    }
}

/// Writes one JSON object per line.
pub struct JsonLinesSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> SegmentSink for JsonLinesSink<W> {
    fn write(&mut self, update: &SegmentUpdate) -> anyhow::Result<()> {
        serde_json::to_writer(&mut self.writer, update)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpdateStats {
    pub written: usize,
    pub length_updates: usize,
    pub route_updates: usize,
}

pub fn flush_updates(
    updates: &[SegmentUpdate],
    sink: &mut impl SegmentSink,
) -> anyhow::Result<UpdateStats> {
    let mut stats = UpdateStats::default();
    for update in updates {
        sink.write(update)
            .with_context(|| format!("Failed to write segment {}", update.id))?;
        stats.written += 1;
        stats.length_updates += update.lengths.is_some() as usize;
        stats.route_updates += update.routes.is_some() as usize;
        if stats.written % FLUSH_PROGRESS_INTERVAL == 0 {
            info!("Update\t{}", stats.written);
        }
    }
    sink.finish()?;
    info!(
        "Update\t{}\tlengths {}\troutes {}",
        stats.written, stats.length_updates, stats.route_updates
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::river_network::graph::EdgeIdx;
    use crate::river_network::record::SegmentRecord;
    use geo::Coord;

    fn c(x: f64, y: f64) -> Coord {
        Coord { x, y }
    }

    fn two_edge_graph() -> (RiverGraph, EdgeIdx, EdgeIdx) {
        let mut graph = RiverGraph::new();
        let a = graph
            .add_edge(&SegmentRecord::new(1, Some(1), "100", 2.0, c(0.0, 0.0), c(1.0, 0.0)))
            .unwrap();
        let b = graph
            .add_edge(&SegmentRecord::new(2, Some(1), "100", 3.0, c(1.0, 0.0), c(2.0, 0.0)))
            .unwrap();
        (graph, a, b)
    }

    #[test]
    fn test_encode_routes_sorts_and_dedups() {
        let base = RoutePath::new(0, 0);
        let r1 = base.append(true);
        let r0 = base.append(false);
        let encoded = encode_routes([&r1, &r0, &r1]).unwrap();
        assert_eq!(
            encoded,
            vec![ByteBuf::from(r0.to_bytes()), ByteBuf::from(r1.to_bytes())]
        );
    }

    #[test]
    fn test_encode_routes_drops_extensions() {
        let base = RoutePath::new(0, 0);
        let stem = base.append(false);
        let further = stem.append(false);
        let side = base.append(true).append(false);
        let encoded = encode_routes([&further, &side, &stem]).unwrap();
        assert_eq!(
            encoded,
            vec![ByteBuf::from(stem.to_bytes()), ByteBuf::from(side.to_bytes())]
        );
    }

    #[test]
    fn test_diff_reports_only_changes() {
        let (mut graph, a, b) = two_edge_graph();
        graph.edge_mut(b).unwrap().downstream_length = 2.0;
        graph
            .edge_mut(a)
            .unwrap()
            .add_route(RoutePath::new(0, 0).append(false));

        let mut snapshot = StoredSnapshot::new();
        snapshot.insert(
            2,
            StoredSegment {
                downstream_length: 2.0004,
                upstream_length: 0.0,
                routes: Vec::new(),
            },
        );

        let updates = diff_updates(&graph, &AHashSet::new(), &snapshot).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].id, 1);
        assert!(updates[0].lengths.is_none());
        assert_eq!(updates[0].routes.as_ref().map(|r| r.len()), Some(1));
    }

    #[test]
    fn test_excluded_ids_are_zeroed() {
        let (graph, _, _) = two_edge_graph();
        let mut snapshot = StoredSnapshot::new();
        snapshot.insert(
            99,
            StoredSegment {
                downstream_length: 5.0,
                upstream_length: 1.0,
                routes: Vec::new(),
            },
        );
        let excluded: AHashSet<i64> = [99, 100].into_iter().collect();

        let updates = diff_updates(&graph, &excluded, &snapshot).unwrap();
        assert_eq!(
            updates,
            vec![SegmentUpdate {
                id: 99,
                lengths: Some(LengthUpdate {
                    downstream_length: 0.0,
                    upstream_length: 0.0,
                }),
                routes: None,
            }]
        );
    }

    #[test]
    fn test_applied_updates_leave_nothing_to_write() {
        let (mut graph, a, _) = two_edge_graph();
        graph.edge_mut(a).unwrap().upstream_length = 3.0;
        graph
            .edge_mut(a)
            .unwrap()
            .add_route(RoutePath::new(0, 0).append(false));

        let mut snapshot = StoredSnapshot::new();
        let updates = diff_updates(&graph, &AHashSet::new(), &snapshot).unwrap();
        assert_eq!(updates.len(), 1);

        let mut sink = VecSink::default();
        let stats = flush_updates(&updates, &mut sink).unwrap();
        assert_eq!(stats.written, 1);
        assert_eq!(stats.length_updates, 1);
        assert_eq!(stats.route_updates, 1);

        snapshot.apply(&sink.updates);
        assert!(diff_updates(&graph, &AHashSet::new(), &snapshot).unwrap().is_empty());
        let captured = StoredSnapshot::capture(&graph, &AHashSet::new()).unwrap();
        assert_eq!(captured.len(), 2);
        assert!(diff_updates(&graph, &AHashSet::new(), &captured).unwrap().is_empty());
    }

    #[test]
    fn test_json_lines_sink() {
        let update = SegmentUpdate {
            id: 7,
            lengths: Some(LengthUpdate {
                downstream_length: 1.5,
                upstream_length: 0.0,
            }),
            routes: None,
        };
        let mut sink = JsonLinesSink::new(Vec::new());
        flush_updates(std::slice::from_ref(&update), &mut sink).unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(
            text,
            "{\"id\":7,\"lengths\":{\"downstream_length\":1.5,\"upstream_length\":0.0}}\n"
        );
        let parsed: SegmentUpdate = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(parsed, update);
    }
}
