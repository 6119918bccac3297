//! Timed insert / delete-min microbenchmark
//!
//! Every worker thread prefills its share, waits on a barrier, then runs a
//! random mix of inserts and delete-mins until the timer expires. Each
//! thread keeps the sum of the keys it inserted minus the keys it removed;
//! the total must match the queue's own key sum afterwards.
//!
//! Usage: `cargo run --release --bin microbench -- --threads 8 --millis 2000`

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use pipq::Pipq;
use pipq_benchmarks::{init_tracing, PqArgs};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "microbench", about = "PIPQ insert/delete-min throughput")]
struct Cli {
    /// Worker threads
    #[arg(short = 'n', long, default_value_t = 4)]
    threads: usize,

    /// Measured run time in milliseconds
    #[arg(short = 't', long, default_value_t = 1_000)]
    millis: u64,

    /// Percentage of operations that insert; the rest delete-min
    #[arg(short = 'i', long, default_value_t = 50, value_parser = clap::value_parser!(u32).range(0..=100))]
    insert_pct: u32,

    /// Keys are drawn uniformly from 1..=max_key
    #[arg(short = 'k', long, default_value_t = 1_000_000)]
    max_key: i64,

    /// Entries inserted before the clock starts, split across threads
    #[arg(short = 'p', long, default_value_t = 100_000)]
    prefill: usize,

    /// Base seed; thread `tid` uses `seed + tid`
    #[arg(long, default_value_t = 1)]
    seed: u64,

    #[command(flatten)]
    pq: PqArgs,
}

#[derive(Debug, Default, Clone, Copy)]
struct ThreadTotals {
    inserts: u64,
    deletes: u64,
    empties: u64,
    /// Inserted keys minus removed keys, prefill included
    key_balance: i64,
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    if cli.threads == 0 || cli.max_key < 1 {
        error!("--threads and --max-key must be positive");
        return ExitCode::FAILURE;
    }

    let config = cli.pq.config(cli.threads);
    let mut pq = match Pipq::<u32>::new(config) {
        Ok(pq) => pq,
        Err(e) => {
            error!("invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let (totals, elapsed) = match run(&pq, &cli) {
        Ok(r) => r,
        Err(e) => {
            error!("worker setup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    report(&mut pq, &cli, &totals, elapsed);

    let balance: i64 = totals.iter().map(|t| t.key_balance).sum();
    let violations = pq.validate_insertion_ordering();
    let key_sum = pq.key_sum();
    let report = pq.deinit();
    println!("{}", report);

    if balance != key_sum || violations != 0 {
        error!(balance, key_sum, violations, "consistency check failed");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(pq: &Pipq<u32>, cli: &Cli) -> pipq::Result<(Vec<ThreadTotals>, Duration)> {
    let threads = cli.threads;
    let barrier = Barrier::new(threads + 1);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|tid| {
                let (barrier, done) = (&barrier, &done);
                s.spawn(move || -> pipq::Result<ThreadTotals> {
                    let ctx = pq.thread_init(tid);
                    let mut rng = StdRng::seed_from_u64(cli.seed + tid as u64);
                    let mut totals = ThreadTotals::default();

                    // Join the barrier even on failure so the timer thread
                    // is not left waiting.
                    if let Ok(ctx) = &ctx {
                        let share = cli.prefill / threads + usize::from(tid < cli.prefill % threads);
                        for _ in 0..share {
                            let key = rng.gen_range(1..=cli.max_key);
                            if ctx.insert(key, tid as u32) {
                                totals.key_balance += key;
                            }
                        }
                    }
                    barrier.wait();
                    let ctx = ctx?;

                    while !done.load(Ordering::Relaxed) {
                        if rng.gen_range(0..100) < cli.insert_pct {
                            let key = rng.gen_range(1..=cli.max_key);
                            if ctx.insert(key, tid as u32) {
                                totals.key_balance += key;
                            }
                            totals.inserts += 1;
                        } else {
                            match ctx.delete_min() {
                                Some((key, _)) => totals.key_balance -= key,
                                None => totals.empties += 1,
                            }
                            totals.deletes += 1;
                        }
                    }
                    Ok(totals)
                })
            })
            .collect();

        barrier.wait();
        let start = Instant::now();
        thread::sleep(Duration::from_millis(cli.millis));
        done.store(true, Ordering::Relaxed);

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

fn report(pq: &mut Pipq<u32>, cli: &Cli, totals: &[ThreadTotals], elapsed: Duration) {
    let inserts: u64 = totals.iter().map(|t| t.inserts).sum();
    let deletes: u64 = totals.iter().map(|t| t.deletes).sum();
    let empties: u64 = totals.iter().map(|t| t.empties).sum();
    let ops = inserts + deletes;
    let secs = elapsed.as_secs_f64();

    info!(
        threads = cli.threads,
        zones = pq.num_zones(),
        policy = %cli.pq.cpu_policy,
        "run finished"
    );

    println!("threads            : {}", cli.threads);
    println!("elapsed            : {:.3} s", secs);
    println!("total ops          : {}", ops);
    println!("throughput         : {:.3} Mops/s", ops as f64 / secs / 1e6);
    println!("inserts            : {}", inserts);
    println!("delete-mins        : {} ({} empty)", deletes, empties);
    for (tid, t) in totals.iter().enumerate() {
        println!(
            "  thread {:>3}       : {:>10} ins {:>10} del  balance {}",
            tid, t.inserts, t.deletes, t.key_balance
        );
    }
    println!("queue size         : {}", pq.size());
    println!("{}", pq.stats());
}
