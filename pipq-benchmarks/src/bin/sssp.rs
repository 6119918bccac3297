//! Parallel label-correcting single-source shortest paths
//!
//! The queue holds `(distance, node)` frontier entries. A thread that pops
//! an entry whose distance is no longer the node's best drops it as dead;
//! otherwise it relaxes every outgoing edge with a CAS on the neighbour's
//! distance and inserts the improved entry. Threads stop after a run of
//! consecutive empty delete-mins.
//!
//! Input is either a file of `a u v w` arc lines (DIMACS) or plain `u v`
//! lines with random weights, or a generated random graph.
//!
//! Usage: `cargo run --release --bin sssp -- --threads 8 --input graph.gr --verify`

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Barrier;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use pipq::Pipq;
use pipq_benchmarks::{init_tracing, PqArgs};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, error, info};

/// Distance of a node not reached yet
const UNREACHED: i64 = -1;

/// Graphs above this size get a longer empty-run allowance for threads that
/// have not extracted anything yet
const EARLY_BREAK_NODES: usize = 1_000;

#[derive(Debug, Parser)]
#[command(name = "sssp", about = "Parallel SSSP with PIPQ as the frontier")]
struct Cli {
    /// Worker threads
    #[arg(short = 't', long, default_value_t = 4)]
    threads: usize,

    /// Graph file; a random graph is generated when absent
    #[arg(short = 'i', long)]
    input: Option<PathBuf>,

    /// Nodes of the generated graph
    #[arg(long, default_value_t = 100_000)]
    nodes: usize,

    /// Out-degree of every node in the generated graph
    #[arg(long, default_value_t = 8)]
    degree: usize,

    /// Weights for unweighted input and generated graphs are drawn from 1..=max_weight
    #[arg(short = 'w', long, default_value_t = 100)]
    max_weight: i64,

    /// Source node; defaults to the first node with outgoing edges
    #[arg(short = 'u', long)]
    source: Option<usize>,

    /// Random seed
    #[arg(short = 's', long, default_value_t = 1)]
    seed: u64,

    /// Check every distance against a sequential Dijkstra
    #[arg(short = 'v', long)]
    verify: bool,

    #[command(flatten)]
    pq: PqArgs,
}

/// Compressed adjacency lists.
struct Graph {
    offsets: Vec<usize>,
    targets: Vec<u32>,
    weights: Vec<i64>,
}

impl Graph {
    fn from_edges(nodes: usize, mut edges: Vec<(u32, u32, i64)>) -> Self {
        edges.sort_unstable_by_key(|&(u, _, _)| u);
        let mut offsets = vec![0; nodes + 1];
        for &(u, _, _) in &edges {
            offsets[u as usize + 1] += 1;
        }
        for i in 0..nodes {
            offsets[i + 1] += offsets[i];
        }
        Self {
            offsets,
            targets: edges.iter().map(|e| e.1).collect(),
            weights: edges.iter().map(|e| e.2).collect(),
        }
    }

    fn random(nodes: usize, degree: usize, max_weight: i64, rng: &mut StdRng) -> Self {
        let mut edges = Vec::with_capacity(nodes * degree);
        for u in 0..nodes {
            for _ in 0..degree {
                let v = rng.gen_range(0..nodes);
                edges.push((u as u32, v as u32, rng.gen_range(1..=max_weight)));
            }
        }
        Self::from_edges(nodes, edges)
    }

    fn load(path: &Path, max_weight: i64, rng: &mut StdRng) -> io::Result<Self> {
        let invalid = |line: usize, what: &str| {
            io::Error::new(io::ErrorKind::InvalidData, format!("line {}: {}", line, what))
        };

        let mut edges = Vec::new();
        let mut nodes = 0usize;
        for (n, line) in BufReader::new(File::open(path)?).lines().enumerate() {
            let line = line?;
            let mut fields = line.split_whitespace();
            let arc = match fields.next() {
                None | Some("c") | Some("p") | Some("#") => continue,
                Some(first) if first.starts_with('#') => continue,
                Some("a") => {
                    let mut num = || -> Option<i64> { fields.next()?.parse().ok() };
                    match (num(), num(), num()) {
                        (Some(u), Some(v), Some(w)) => (u, v, w),
                        _ => return Err(invalid(n + 1, "expected `a u v w`")),
                    }
                }
                Some(first) => {
                    let u = first.parse().map_err(|_| invalid(n + 1, "bad source"))?;
                    let v = fields
                        .next()
                        .and_then(|f| f.parse().ok())
                        .ok_or_else(|| invalid(n + 1, "expected `u v`"))?;
                    (u, v, rng.gen_range(1..=max_weight))
                }
            };

            let (u, v, w) = arc;
            if u < 0 || v < 0 || u > u32::MAX as i64 || v > u32::MAX as i64 || w < 0 {
                return Err(invalid(n + 1, "node id or weight out of range"));
            }
            nodes = nodes.max(u as usize + 1).max(v as usize + 1);
            edges.push((u as u32, v as u32, w));
        }
        Ok(Self::from_edges(nodes, edges))
    }

    fn len(&self) -> usize {
        self.offsets.len() - 1
    }

    fn edges(&self, u: usize) -> impl Iterator<Item = (usize, i64)> + '_ {
        let range = self.offsets[u]..self.offsets[u + 1];
        self.targets[range.clone()]
            .iter()
            .zip(&self.weights[range])
            .map(|(&v, &w)| (v as usize, w))
    }

    fn degree(&self, u: usize) -> usize {
        self.offsets[u + 1] - self.offsets[u]
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ThreadTotals {
    removals: u64,
    processed: u64,
    dead: u64,
    inserts: u64,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    if cli.threads == 0 || cli.max_weight < 1 {
        error!("--threads and --max-weight must be positive");
        return ExitCode::FAILURE;
    }

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let graph = match &cli.input {
        Some(path) => match Graph::load(path, cli.max_weight, &mut rng) {
            Ok(g) => g,
            Err(e) => {
                error!("cannot read {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
        },
        None => Graph::random(cli.nodes, cli.degree, cli.max_weight, &mut rng),
    };
    if graph.len() == 0 {
        error!("graph has no nodes");
        return ExitCode::FAILURE;
    }

    let source = cli
        .source
        .unwrap_or_else(|| (0..graph.len()).find(|&u| graph.degree(u) > 0).unwrap_or(0));
    if source >= graph.len() {
        error!(source, nodes = graph.len(), "source node out of range");
        return ExitCode::FAILURE;
    }
    info!(nodes = graph.len(), edges = graph.targets.len(), source, "graph ready");

    let pq = match Pipq::<u32>::new(cli.pq.config(cli.threads)) {
        Ok(pq) => pq,
        Err(e) => {
            error!("invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let dist: Vec<AtomicI64> = (0..graph.len()).map(|_| AtomicI64::new(UNREACHED)).collect();
    dist[source].store(0, Ordering::Relaxed);

    let (totals, elapsed) = match run(&pq, &graph, &dist, source, cli.threads) {
        Ok(r) => r,
        Err(e) => {
            error!("worker setup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let sum = |f: fn(&ThreadTotals) -> u64| totals.iter().map(f).sum::<u64>();
    let reached = dist.iter().filter(|d| d.load(Ordering::Relaxed) != UNREACHED).count();
    println!("threads            : {}", cli.threads);
    println!("elapsed            : {:.3} s", elapsed.as_secs_f64());
    println!("nodes reached      : {} / {}", reached, graph.len());
    println!("removals           : {}", sum(|t| t.removals));
    println!("processed          : {}", sum(|t| t.processed));
    println!("dead entries       : {}", sum(|t| t.dead));
    println!("inserts            : {}", sum(|t| t.inserts));
    println!("{}", pq.stats());

    let report = pq.deinit();
    if report.size() != 0 {
        error!(left = report.size(), "frontier not drained");
        return ExitCode::FAILURE;
    }

    if cli.verify {
        let expected = dijkstra(&graph, source);
        let wrong = expected
            .iter()
            .zip(&dist)
            .filter(|(e, d)| **e != d.load(Ordering::Relaxed))
            .count();
        if wrong != 0 {
            error!(wrong, "distances differ from sequential Dijkstra");
            return ExitCode::FAILURE;
        }
        println!("verification       : ok");
    }
    ExitCode::SUCCESS
}

fn run(
    pq: &Pipq<u32>,
    graph: &Graph,
    dist: &[AtomicI64],
    source: usize,
    threads: usize,
) -> pipq::Result<(Vec<ThreadTotals>, Duration)> {
    let barrier = Barrier::new(threads + 1);

    thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|tid| {
                let barrier = &barrier;
                s.spawn(move || -> pipq::Result<ThreadTotals> {
                    let ctx = pq.thread_init(tid);
                    if let (0, Ok(ctx)) = (tid, &ctx) {
                        ctx.insert(0, source as u32);
                    }
                    barrier.wait();
                    let ctx = ctx?;

                    let mut totals = ThreadTotals::default();
                    let mut fail = 0;
                    loop {
                        totals.removals += 1;
                        let Some((d, u)) = ctx.delete_min() else {
                            fail += 1;
                            let multiplier = if totals.processed == 0 && graph.len() > EARLY_BREAK_NODES {
                                200
                            } else {
                                20
                            };
                            if fail > multiplier * threads {
                                break;
                            }
                            continue;
                        };
                        fail = 0;

                        let u = u as usize;
                        if d != dist[u].load(Ordering::Acquire) {
                            totals.dead += 1;
                            continue;
                        }
                        totals.processed += 1;

                        for (v, w) in graph.edges(u) {
                            let candidate = d + w;
                            let mut current = dist[v].load(Ordering::Acquire);
                            while current == UNREACHED || candidate < current {
                                match dist[v].compare_exchange(
                                    current,
                                    candidate,
                                    Ordering::AcqRel,
                                    Ordering::Acquire,
                                ) {
                                    Ok(_) => {
                                        ctx.insert(candidate, v as u32);
                                        totals.inserts += 1;
                                        break;
                                    }
                                    Err(seen) => current = seen,
                                }
                            }
                        }
                    }
                    debug!(tid, processed = totals.processed, "worker done");
                    Ok(totals)
                })
            })
            .collect();

        barrier.wait();
        let start = Instant::now();

        let mut totals = Vec::with_capacity(threads);
        for h in handles {
            match h.join() {
                Ok(r) => totals.push(r?),
                Err(panic) => std::panic::resume_unwind(panic),
            }
        }
        Ok((totals, start.elapsed()))
    })
}

fn dijkstra(graph: &Graph, source: usize) -> Vec<i64> {
    let mut dist = vec![UNREACHED; graph.len()];
    let mut heap = BinaryHeap::new();
    dist[source] = 0;
    heap.push(Reverse((0i64, source)));

    while let Some(Reverse((d, u))) = heap.pop() {
        if d != dist[u] {
            continue;
        }
        for (v, w) in graph.edges(u) {
            let candidate = d + w;
            if dist[v] == UNREACHED || candidate < dist[v] {
                dist[v] = candidate;
                heap.push(Reverse((candidate, v)));
            }
        }
    }
    dist
}
