use std::{
    process::ExitCode,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chainfeed::{
    FeedHealth, HexDisplayExt, MemoryStore, Record, RetryPolicy, SyncConfig,
    SyncEngine,
};
use clap::Parser;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Runs random writers against an in-memory ledger while a sync engine
/// follows it, then checks that the local view caught up.
#[derive(Parser, Debug)]
#[command(name = "chainfeed", version)]
struct Args {
    /// Records created before the engine starts.
    #[arg(long, env = "CHAINFEED_INITIAL", default_value_t = 5)]
    initial: usize,
    /// Concurrent writer tasks.
    #[arg(long, env = "CHAINFEED_WRITERS", default_value_t = 3)]
    writers: usize,
    /// Operations per writer.
    #[arg(long, env = "CHAINFEED_OPS", default_value_t = 40)]
    ops: usize,
    /// RNG seed. Random when unset.
    #[arg(long, env = "CHAINFEED_SEED")]
    seed: Option<u64>,
    /// Chance that an operation is followed by a failing fetch.
    #[arg(long, env = "CHAINFEED_FAULT_RATE", default_value_t = 0.0)]
    fault_rate: f64,
    /// Drop the event subscription halfway through.
    #[arg(long, env = "CHAINFEED_DROP_FEED")]
    drop_feed: bool,
    /// Seconds to wait for the view to converge.
    #[arg(long, env = "CHAINFEED_DEADLINE", default_value_t = 10)]
    deadline: u64,
    #[arg(long, env = "CHAINFEED_MAX_IN_FLIGHT", default_value_t = 16)]
    max_in_flight: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    let seed = args.seed.unwrap_or_else(rand::random);
    info!("seed {}", seed);

    let store = Arc::new(MemoryStore::new());
    for n in 0..args.initial {
        store.create(&format!("post {n}"), "seeded").await;
    }

    let config = SyncConfig::builder()
        .max_in_flight(args.max_in_flight)
        .fetch_timeout(Duration::from_secs(2))
        .resubscribe(
            RetryPolicy::builder()
                .max_attempts(8)
                .initial_backoff(Duration::from_millis(50))
                .max_backoff(Duration::from_secs(1))
                .build(),
        )
        .build();
    let mut handle = match SyncEngine::new(store.clone(), config)
        .start_from_remote_head()
        .await
    {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("could not start: {e}");
            return ExitCode::FAILURE;
        }
    };
    let commits = Arc::new(AtomicU64::new(0));
    let counter = commits.clone();
    handle.on_change(move |_| {
        counter.fetch_add(1, Ordering::Relaxed);
    });

    let writers = (0..args.writers)
        .map(|n| {
            let store = store.clone();
            let rng = StdRng::seed_from_u64(seed.wrapping_add(n as u64));
            tokio::spawn(write_randomly(store, rng, n, args.ops, args.fault_rate))
        })
        .collect::<Vec<_>>();

    if args.drop_feed {
        tokio::time::sleep(Duration::from_millis(5 * args.ops as u64)).await;
        warn!("dropping the event feed");
        store.disconnect_subscribers().await;
    }
    for writer in writers {
        if let Err(e) = writer.await {
            warn!("writer failed: {}", e);
        }
    }

    let converged = wait_for_convergence(
        &store,
        &handle,
        Duration::from_secs(args.deadline),
    )
    .await;

    let snapshot = handle.snapshot();
    for record in snapshot.records() {
        println!(
            "{}  {:<24} <- {}",
            record.id.hex().abbrev(),
            record.title,
            record.previous_id.hex().abbrev()
        );
    }
    println!(
        "{} record(s), version {}, {} callback(s), feed {:?}",
        snapshot.len(),
        snapshot.version,
        commits.load(Ordering::Relaxed),
        snapshot.feed
    );
    handle.stop().await;

    if converged {
        println!("view converged");
        ExitCode::SUCCESS
    } else {
        println!("view did not converge");
        ExitCode::FAILURE
    }
}

async fn write_randomly(
    store: Arc<MemoryStore>,
    mut rng: StdRng,
    writer: usize,
    ops: usize,
    fault_rate: f64,
) {
    for op in 0..ops {
        let live = store.live_ids().await;
        let roll = rng.gen_range(0..4);
        match live.choose(&mut rng).copied() {
            Some(id) if roll == 0 => {
                let result = store
                    .update(id, &format!("w{writer} edit {op}"), "edited")
                    .await;
                debug!("update {}: {:?}", id.hex().abbrev(), result);
            }
            Some(id) if roll == 1 => {
                let result = store.delete(id).await;
                debug!("delete {}: {:?}", id.hex().abbrev(), result);
            }
            _ => {
                store.create(&format!("w{writer} post {op}"), "").await;
            }
        }
        if fault_rate > 0.0 && rng.gen_bool(fault_rate.min(1.0)) {
            store.fail_next_fetches(1).await;
        }
        tokio::time::sleep(Duration::from_millis(rng.gen_range(0..10))).await;
    }
}

/// Polls until the view matches the ledger. Asks for a fresh walk when the
/// feed was lost or half the deadline passed without convergence.
async fn wait_for_convergence(
    store: &MemoryStore,
    handle: &chainfeed::SyncHandle,
    deadline: Duration,
) -> bool {
    let started = Instant::now();
    let mut repaired = false;
    while started.elapsed() < deadline {
        let snapshot = handle.snapshot();
        let expected: Vec<Record> = store.true_order().await;
        if snapshot.is_live() && snapshot.records == expected {
            return true;
        }
        let stalled = started.elapsed() > deadline / 2;
        if !repaired && (snapshot.feed == FeedHealth::Lost || stalled) {
            info!("view still behind, requesting a fresh walk");
            handle.resubscribe();
            repaired = true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
