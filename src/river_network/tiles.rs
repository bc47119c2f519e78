// ===========================================================================
// Reduced-detail tiles
// ===========================================================================
//
// Each tile is simplified on its own private graph: pass-through nodes are
// merged away (when the tile's stream order allows it) and the surviving
// edges that intersect the tile are handed to the caller. Tiles are pulled
// from one shared queue by a fixed set of worker threads.

use anyhow::{anyhow, Result};
use log::{debug, info};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use super::graph::Edge;
use super::loader::load_network;
use super::record::SegmentRecord;
use super::topology::merge_pass_through_nodes;
use crate::config::NetworkConfig;

#[derive(Debug, Clone)]
pub struct TileJob {
    pub tile_id: u64,
    /// Smallest stream order drawn at this tile's level of detail.
    pub stream_order: i32,
    pub records: Vec<SegmentRecord>,
}

#[derive(Debug)]
pub struct TileOutput {
    pub tile_id: u64,
    pub edges: Vec<Edge>,
    pub merged: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TileStats {
    pub tiles: usize,
    pub edges_in: usize,
    pub edges_out: usize,
    pub merged: usize,
}

impl TileStats {
    fn add(&mut self, other: TileStats) {
        self.tiles += other.tiles;
        self.edges_in += other.edges_in;
        self.edges_out += other.edges_out;
        self.merged += other.merged;
    }
}

/// Every record is drawn, whatever its watershed code; the exclusion only
/// applies to the length and route passes.
pub fn simplify_tile(job: TileJob, config: &NetworkConfig) -> TileOutput {
    let tile_config = NetworkConfig {
        excluded_watershed_code: None,
        ..config.clone()
    };
    let mut graph = load_network(job.records, &tile_config).graph;

    let merged = if job.stream_order >= config.min_merge_stream_order {
        merge_pass_through_nodes(&mut graph).merged
    } else {
        0
    };

    let edges = graph
        .edges()
        .filter(|e| e.intersects)
        .cloned()
        .collect();

    TileOutput {
        tile_id: job.tile_id,
        edges,
        merged,
    }
}

/// Simplify every job, handing each finished tile to `sink`.
///
/// The first sink error stops the worker that hit it; the other workers
/// finish the queue and the error is returned.
pub fn simplify_tiles<F>(jobs: Vec<TileJob>, config: &NetworkConfig, sink: F) -> Result<TileStats>
where
    F: Fn(TileOutput) -> Result<()> + Sync,
{
    let total = jobs.len();
    let queue = Mutex::new(VecDeque::from(jobs));
    let done = AtomicUsize::new(0);
    let workers = config.tile_workers.max(1);

    let results: Vec<Result<TileStats>> = thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|_| s.spawn(|| drain_queue(&queue, config, &sink, &done)))
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(anyhow!("Tile worker panicked")))
            })
            .collect()
    });

    let mut stats = TileStats::default();
    for result in results {
        stats.add(result?);
    }
    info!(
        "Tiles\t{}/{}\tedges {} -> {}\tmerged {}",
        stats.tiles, total, stats.edges_in, stats.edges_out, stats.merged
    );
    Ok(stats)
}

fn drain_queue<F>(
    queue: &Mutex<VecDeque<TileJob>>,
    config: &NetworkConfig,
    sink: &F,
    done: &AtomicUsize,
) -> Result<TileStats>
where
    F: Fn(TileOutput) -> Result<()> + Sync,
{
    let mut stats = TileStats::default();
    loop {
        let job = queue
            .lock()
            .map_err(|_| anyhow!("Tile queue lock poisoned"))?
            .pop_front();
        let Some(job) = job else {
            break;
        };

        let tile_id = job.tile_id;
        let edges_in = job.records.len();
        let output = simplify_tile(job, config);
        debug!(
            "Tile {}\t{} -> {}\tmerged {}",
            tile_id,
            edges_in,
            output.edges.len(),
            output.merged
        );

        stats.add(TileStats {
            tiles: 1,
            edges_in,
            edges_out: output.edges.len(),
            merged: output.merged,
        });
        sink(output)?;

        let n = done.fetch_add(1, Ordering::Relaxed) + 1;
        if config.progress_interval > 0 && n % config.progress_interval == 0 {
            info!("Tiles\t{}", n);
        }
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Coord;

    fn c(x: f64, y: f64) -> Coord {
        Coord { x, y }
    }

    fn chain(offset: f64) -> Vec<SegmentRecord> {
        vec![
            SegmentRecord::new(1, Some(1), "100", 1.0, c(offset, 0.0), c(offset + 1.0, 0.0)),
            SegmentRecord::new(2, Some(1), "100", 1.0, c(offset + 1.0, 0.0), c(offset + 2.0, 0.0)),
            SegmentRecord::new(3, Some(1), "100", 1.0, c(offset + 2.0, 0.0), c(offset + 3.0, 0.0)),
        ]
    }

    #[test]
    fn test_stream_order_gates_merging() {
        let config = NetworkConfig::default();
        let merged = simplify_tile(
            TileJob {
                tile_id: 1,
                stream_order: 2,
                records: chain(0.0),
            },
            &config,
        );
        assert_eq!(merged.merged, 2);
        assert_eq!(merged.edges.len(), 1);
        assert_eq!(merged.edges[0].id, 1);
        assert_eq!(merged.edges[0].length, 3.0);

        let untouched = simplify_tile(
            TileJob {
                tile_id: 2,
                stream_order: 1,
                records: chain(0.0),
            },
            &config,
        );
        assert_eq!(untouched.merged, 0);
        assert_eq!(untouched.edges.len(), 3);
    }

    #[test]
    fn test_non_intersecting_edges_are_dropped() {
        let mut records = chain(0.0);
        records[2].intersects = Some(false);
        records[2].blue_line_key = Some(2);
        let output = simplify_tile(
            TileJob {
                tile_id: 1,
                stream_order: 1,
                records,
            },
            &NetworkConfig::default(),
        );
        assert_eq!(output.edges.len(), 2);
        assert!(output.edges.iter().all(|e| e.id != 3));
    }

    #[test]
    fn test_excluded_watershed_code_is_still_drawn() {
        let records = vec![
            SegmentRecord::new(1, Some(1), "100", 1.0, c(0.0, 0.0), c(1.0, 0.0)),
            SegmentRecord::new(2, Some(2), "999", 1.0, c(1.0, 0.0), c(1.0, 1.0)),
        ];
        let output = simplify_tile(
            TileJob {
                tile_id: 1,
                stream_order: 2,
                records,
            },
            &NetworkConfig::default(),
        );
        let mut ids: Vec<i64> = output.edges.iter().map(|e| e.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_workers_drain_whole_queue() {
        let config = NetworkConfig {
            tile_workers: 3,
            ..NetworkConfig::default()
        };
        let jobs: Vec<TileJob> = (0..10)
            .map(|i| TileJob {
                tile_id: i,
                stream_order: 2,
                records: chain(i as f64 * 10.0),
            })
            .collect();

        let seen = Mutex::new(Vec::new());
        let stats = simplify_tiles(jobs, &config, |output| {
            seen.lock().unwrap().push(output.tile_id);
            Ok(())
        })
        .unwrap();

        let mut seen = seen.into_inner().unwrap();
        seen.sort();
        assert_eq!(seen, (0..10).collect::<Vec<u64>>());
        assert_eq!(stats.tiles, 10);
        assert_eq!(stats.edges_in, 30);
        assert_eq!(stats.edges_out, 10);
        assert_eq!(stats.merged, 20);
    }

    #[test]
    fn test_sink_error_is_returned() {
        let jobs = vec![TileJob {
            tile_id: 5,
            stream_order: 1,
            records: chain(0.0),
        }];
        let result = simplify_tiles(jobs, &NetworkConfig::default(), |output| {
            Err(anyhow!("disk full for tile {}", output.tile_id))
        });
        assert_eq!(result.unwrap_err().to_string(), "disk full for tile 5");
    }
}
