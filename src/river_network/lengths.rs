// ===========================================================================
// Downstream / upstream length propagation
// ===========================================================================
//
// For an edge, the downstream length is the total length of every distinct
// edge reachable by walking against flow from its from-node; the upstream
// length walks with flow from its to-node. Each edge gets its own visited
// set, so an edge shared by two branches of a braid counts once per walk.
//
// The walks are read-only and independent, so they run in parallel; the
// results are written back after the parallel phase.

use ahash::AHashSet;
use log::info;
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::graph::{EdgeIdx, NodeIdx, RiverGraph};
use super::record::{from_mm, to_mm};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    /// Against edge direction, through in-edges.
    Downstream,
    /// With edge direction, through out-edges.
    Upstream,
}

/// Reusable scratch space for one walk at a time.
#[derive(Default)]
pub struct LengthWalker {
    visited: AHashSet<EdgeIdx>,
    stack: Vec<NodeIdx>,
}

impl LengthWalker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total length in millimetres of all distinct edges reachable from `start`.
    pub fn total_mm(&mut self, graph: &RiverGraph, start: NodeIdx, direction: FlowDirection) -> i64 {
        self.visited.clear();
        self.stack.clear();
        self.stack.push(start);

        let mut total = 0i64;
        while let Some(node) = self.stack.pop() {
            let next_edges = match direction {
                FlowDirection::Downstream => graph.in_edges(node),
                FlowDirection::Upstream => graph.out_edges(node),
            };
            for &idx in next_edges {
                if !self.visited.insert(idx) {
                    continue;
                }
                let Some(edge) = graph.edge(idx) else {
                    continue;
                };
                total += to_mm(edge.length);
                if !edge.is_loop() {
                    self.stack.push(match direction {
                        FlowDirection::Downstream => edge.from,
                        FlowDirection::Upstream => edge.to,
                    });
                }
            }
        }
        total
    }

    pub fn downstream_length(&mut self, graph: &RiverGraph, edge: EdgeIdx) -> Option<f64> {
        let from = graph.edge(edge)?.from;
        Some(from_mm(self.total_mm(graph, from, FlowDirection::Downstream)))
    }

    pub fn upstream_length(&mut self, graph: &RiverGraph, edge: EdgeIdx) -> Option<f64> {
        let to = graph.edge(edge)?.to;
        Some(from_mm(self.total_mm(graph, to, FlowDirection::Upstream)))
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct LengthStats {
    pub edges: usize,
    /// Edges whose stored downstream or upstream length changed.
    pub changed: usize,
    pub max_downstream_length: f64,
    pub max_upstream_length: f64,
}

/// Compute and store the downstream and upstream length of every edge.
pub fn set_downstream_upstream_lengths(
    graph: &mut RiverGraph,
    progress_interval: usize,
) -> LengthStats {
    let indices = graph.edge_indices();
    let counter = AtomicUsize::new(0);

    let results: Vec<(EdgeIdx, f64, f64)> = {
        let graph: &RiverGraph = graph;
        indices
            .par_iter()
            .map_init(LengthWalker::new, |walker, &idx| {
                let downstream = walker.downstream_length(graph, idx).unwrap_or(0.0);
                let upstream = walker.upstream_length(graph, idx).unwrap_or(0.0);

                let done = counter.fetch_add(1, Ordering::Relaxed) + 1;
                if progress_interval > 0 && done % progress_interval == 0 {
                    info!("Calculate lengths\t{}", done);
                }
                (idx, downstream, upstream)
            })
            .collect()
    };

    let mut stats = LengthStats::default();
    for (idx, downstream, upstream) in results {
        let Some(edge) = graph.edge_mut(idx) else {
            continue;
        };
        if edge.downstream_length != downstream || edge.upstream_length != upstream {
            stats.changed += 1;
        }
        edge.downstream_length = downstream;
        edge.upstream_length = upstream;
        stats.edges += 1;
        stats.max_downstream_length = stats.max_downstream_length.max(downstream);
        stats.max_upstream_length = stats.max_upstream_length.max(upstream);
    }
    info!("Calculate lengths\t{}", stats.edges);
    stats
}
