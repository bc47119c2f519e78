//! River network graph: loading, topology maintenance, length propagation
//! and route path assignment.

pub mod graph;
pub mod lengths;
pub mod loader;
pub mod persistence;
pub mod record;
pub mod route_path;
pub mod routes;
pub mod tiles;
pub mod topology;


pub use graph::{Edge, EdgeIdx, GraphError, Node, NodeIdx, RiverGraph};
pub use record::{MeasureRange, SegmentRecord};
pub use route_path::{RoutePath, RoutePathError};
