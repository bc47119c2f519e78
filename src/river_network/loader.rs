// ===========================================================================
// Segment record stream -> river graph
// ===========================================================================

use ahash::AHashSet;
use log::{info, warn};

use super::graph::{GraphError, RiverGraph};
use super::record::SegmentRecord;
use crate::config::NetworkConfig;

pub struct LoadedNetwork {
    pub graph: RiverGraph,
    /// Segment ids left out because of their watershed code. Their lengths
    /// are reported as zero and they never receive routes.
    pub excluded_ids: AHashSet<i64>,
    /// Records that could not be turned into edges.
    pub rejected: Vec<(i64, GraphError)>,
}

impl LoadedNetwork {
    pub fn loaded(&self) -> usize {
        self.graph.edge_count()
    }
}

pub fn is_excluded(record: &SegmentRecord, config: &NetworkConfig) -> bool {
    config
        .excluded_watershed_code
        .as_deref()
        .is_some_and(|code| record.watershed_code == code)
}

/// Build a graph from `records`, in order.
///
/// Bad records are logged and skipped; they do not stop the load.
pub fn load_network<I>(records: I, config: &NetworkConfig) -> LoadedNetwork
where
    I: IntoIterator<Item = SegmentRecord>,
{
    let mut graph = RiverGraph::with_precision(config.node_precision);
    let mut excluded_ids = AHashSet::new();
    let mut rejected = Vec::new();
    let mut read = 0usize;

    for record in records {
        read += 1;
        if config.progress_interval > 0 && read % config.progress_interval == 0 {
            info!("Read\t{}", read);
        }

        if is_excluded(&record, config) {
            excluded_ids.insert(record.id);
            continue;
        }
        if let Err(e) = graph.add_edge(&record) {
            warn!("Skipping segment {}: {}", record.id, e);
            rejected.push((record.id, e));
        }
    }

    info!(
        "Read\t{}\tedges {}\tnodes {}\texcluded {}\trejected {}",
        read,
        graph.edge_count(),
        graph.node_count(),
        excluded_ids.len(),
        rejected.len()
    );

    LoadedNetwork {
        graph,
        excluded_ids,
        rejected,
    }
}
