// ===========================================================================
// Route path assignment
// ===========================================================================
//
// Every outlet starts a fresh walk along out-edges. At a fork the primary
// branch is descended completely before the secondary one, so the first
// route an edge receives is the one through the main stem. An edge keeps a
// route only if none of its stored routes is a prefix of it.
//
// The walk is an explicit stack machine instead of recursion. Frames are
// pushed in reverse so they pop in the order a recursive walk would visit
// them: enter node, primary branch, secondary branch, leave node.

use ahash::AHashSet;
use log::{debug, error, info, trace};
use std::cmp::Ordering;
use thiserror::Error;

use super::graph::{Edge, EdgeIdx, NodeIdx, RiverGraph};
use super::route_path::{RoutePath, RoutePathError};

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Node {node} at ({x}, {y}) has {count} out edges, at most 2 are supported")]
    TooManyOutEdges {
        node: NodeIdx,
        x: f64,
        y: f64,
        count: usize,
    },
    #[error("Outlet {node} cannot anchor a route path: {source}")]
    Origin {
        node: NodeIdx,
        #[source]
        source: RoutePathError,
    },
}

/// Diagnostics gathered while walking. Returned by value; nothing global.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouteStats {
    pub outlets: usize,
    pub failed_outlets: usize,
    pub routes_added: usize,
    /// Edges holding at least one route after the pass.
    pub edges_routed: usize,
    pub max_route_count: usize,
    pub max_route_length: usize,
    /// Walks that reached a node already on the active path.
    pub cycle_aborts: usize,
    /// Forks where the current blue line key picked neither or both branches.
    pub ambiguous_forks: usize,
}

enum Step {
    Enter {
        node: NodeIdx,
        route: RoutePath,
        current: Option<i32>,
    },
    Descend {
        edge: EdgeIdx,
        route: RoutePath,
        added: bool,
        current: Option<i32>,
    },
    Leave(NodeIdx),
}

/// Decide whether `first` is the primary branch of a two-way fork.
/// The second value is true when the choice fell back to the default.
pub fn first_is_primary(first: &Edge, second: &Edge, current: Option<i32>) -> (bool, bool) {
    match current {
        None => {
            let order = first
                .watershed_code
                .cmp(&second.watershed_code)
                .then_with(|| first.local_watershed_code.cmp(&second.local_watershed_code));
            (order != Ordering::Greater, false)
        }
        Some(key) => {
            match (
                first.blue_line_key == Some(key),
                second.blue_line_key == Some(key),
            ) {
                (true, false) => (true, false),
                (false, true) => (false, false),
                _ => (true, true),
            }
        }
    }
}

/// Per-walk state. One assigner can walk any number of outlets in turn;
/// the visited and claimed sets are reset for each.
pub struct RouteAssigner {
    /// Nodes on the active path of the current walk.
    on_path: Vec<bool>,
    claimed_keys: AHashSet<Option<i32>>,
    stack: Vec<Step>,
    stats: RouteStats,
}

impl RouteAssigner {
    pub fn new(graph: &RiverGraph) -> Self {
        Self {
            on_path: vec![false; graph.node_count()],
            claimed_keys: AHashSet::new(),
            stack: Vec::new(),
            stats: RouteStats::default(),
        }
    }

    pub fn stats(&self) -> RouteStats {
        self.stats
    }

    /// A branch may be descended if its route was stored and either its blue
    /// line key is unclaimed in this walk or it continues the current key.
    fn claim(&mut self, blue_line_key: Option<i32>, added: bool, current: Option<i32>) -> bool {
        added && (self.claimed_keys.insert(blue_line_key) || blue_line_key == current)
    }

    fn add_route(&mut self, graph: &mut RiverGraph, idx: EdgeIdx, route: &RoutePath) -> bool {
        let Some(edge) = graph.edge_mut(idx) else {
            return false;
        };
        if !edge.add_route(route.clone()) {
            return false;
        }
        self.stats.routes_added += 1;
        self.stats.max_route_count = self.stats.max_route_count.max(edge.routes().len());
        self.stats.max_route_length = self.stats.max_route_length.max(route.edge_count());
        true
    }

    /// Walk everything reachable from `outlet`.
    ///
    /// On error the walk stops where it is; routes already stored stay.
    pub fn walk_outlet(&mut self, graph: &mut RiverGraph, outlet: NodeIdx) -> Result<(), RouteError> {
        self.claimed_keys.clear();
        self.stack.clear();
        if self.on_path.len() < graph.node_count() {
            self.on_path.resize(graph.node_count(), false);
        }

        let origin = RoutePath::from_coord(graph.node(outlet).coord)
            .map_err(|source| RouteError::Origin { node: outlet, source })?;
        self.stack.push(Step::Enter {
            node: outlet,
            route: origin,
            current: None,
        });

        let result = self.run(graph);
        if result.is_err() {
            for step in self.stack.drain(..) {
                if let Step::Leave(node) = step {
                    self.on_path[node.index()] = false;
                }
            }
        }
        result
    }

    fn run(&mut self, graph: &mut RiverGraph) -> Result<(), RouteError> {
        while let Some(step) = self.stack.pop() {
            match step {
                Step::Enter {
                    node,
                    route,
                    current,
                } => self.enter(graph, node, route, current)?,
                Step::Descend {
                    edge,
                    route,
                    added,
                    current,
                } => {
                    let Some(e) = graph.edge(edge) else {
                        continue;
                    };
                    let (key, to) = (e.blue_line_key, e.to);
                    if self.claim(key, added, current) {
                        self.stack.push(Step::Enter {
                            node: to,
                            route,
                            current: key,
                        });
                    }
                }
                Step::Leave(node) => self.on_path[node.index()] = false,
            }
        }
        Ok(())
    }

    fn enter(
        &mut self,
        graph: &mut RiverGraph,
        node: NodeIdx,
        route: RoutePath,
        current: Option<i32>,
    ) -> Result<(), RouteError> {
        let out: Vec<EdgeIdx> = graph.out_edges(node).to_vec();
        if out.is_empty() {
            return Ok(());
        }
        if self.on_path[node.index()] {
            self.stats.cycle_aborts += 1;
            trace!("Cycle at {} ({})", node, route);
            return Ok(());
        }

        match out[..] {
            [edge] => {
                self.on_path[node.index()] = true;
                self.stack.push(Step::Leave(node));

                let next = route.append(false);
                let added = self.add_route(graph, edge, &next);
                self.stack.push(Step::Descend {
                    edge,
                    route: next,
                    added,
                    current,
                });
            }
            [edge1, edge2] => {
                let (Some(e1), Some(e2)) = (graph.edge(edge1), graph.edge(edge2)) else {
                    return Ok(());
                };
                let (edge1_primary, ambiguous) = first_is_primary(e1, e2, current);
                if ambiguous {
                    self.stats.ambiguous_forks += 1;
                    debug!(
                        "Ambiguous fork at {}: edges {} and {}, current key {:?}",
                        node, e1.id, e2.id, current
                    );
                }

                self.on_path[node.index()] = true;
                self.stack.push(Step::Leave(node));

                let route1 = route.append(!edge1_primary);
                let route2 = route.append(edge1_primary);
                let added1 = self.add_route(graph, edge1, &route1);
                let added2 = self.add_route(graph, edge2, &route2);

                let branch1 = Step::Descend {
                    edge: edge1,
                    route: route1,
                    added: added1,
                    current,
                };
                let branch2 = Step::Descend {
                    edge: edge2,
                    route: route2,
                    added: added2,
                    current,
                };
                // Secondary goes on the stack first so the primary pops first.
                if edge1_primary {
                    self.stack.push(branch2);
                    self.stack.push(branch1);
                } else {
                    self.stack.push(branch1);
                    self.stack.push(branch2);
                }
            }
            _ => {
                let coord = graph.node(node).coord;
                return Err(RouteError::TooManyOutEdges {
                    node,
                    x: coord.x,
                    y: coord.y,
                    count: out.len(),
                });
            }
        }
        Ok(())
    }
}

/// Assign route paths from every outlet of `graph`, in node order.
///
/// A malformed subtree aborts only its own outlet; the failure is logged and
/// the remaining outlets are still walked.
pub fn assign_routes(graph: &mut RiverGraph, progress_interval: usize) -> RouteStats {
    let mut assigner = RouteAssigner::new(graph);
    let outlets: Vec<NodeIdx> = graph.outlets().collect();
    let mut failed = 0;

    for (i, outlet) in outlets.iter().enumerate() {
        if let Err(e) = assigner.walk_outlet(graph, *outlet) {
            error!("Route assignment aborted for outlet {}: {}", outlet, e);
            failed += 1;
        }
        if progress_interval > 0 && (i + 1) % progress_interval == 0 {
            info!("Outlet\t{}", i + 1);
        }
    }

    let mut stats = assigner.stats();
    stats.outlets = outlets.len();
    stats.failed_outlets = failed;
    stats.edges_routed = graph.edges().filter(|e| !e.routes().is_empty()).count();
    info!(
        "Outlet\t{}\tmax routes/edge {}\tmax route length {}",
        stats.outlets, stats.max_route_count, stats.max_route_length
    );
    stats
}

/// Drop every stored route, e.g. before reassigning after topology edits.
pub fn clear_routes(graph: &mut RiverGraph) {
    graph.edges_mut().for_each(|e| e.clear_routes());
}
