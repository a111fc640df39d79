//! Load run: track many users at once through the worker pool.
//!
//! Run with: cargo run --release --example high_volume -- [users]

use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reward_tracker::simulation::{generate_users, SimulatedGps, SimulatedRewardCentral, StaticCatalog};
use reward_tracker::{EngineConfig, RewardEngine};

fn main() {
    let user_count: usize = env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(10_000);

    // Provider latencies in the range of a remote service
    let gps = Arc::new(SimulatedGps::new(Duration::from_millis(5)));
    let scoring = Arc::new(SimulatedRewardCentral::new(Duration::from_millis(2)));
    let config = EngineConfig {
        tracking_threshold_miles: 500.0,
        ..EngineConfig::default()
    };

    let engine = RewardEngine::new(gps, scoring, &StaticCatalog::sample(), config)
        .expect("engine should start");
    println!("High Volume Run\n");
    println!("Users: {}, workers: {}, queue: {}\n",
        user_count, engine.pool().size(), engine.pool().queue_capacity());

    let users = generate_users(user_count, 3);

    // Tracking
    let start = Instant::now();
    let report = engine
        .track_all(&users)
        .expect("engine is running")
        .wait_timeout(Duration::from_secs(15 * 60));
    println!("1. track_all: {:?}", report.state);
    println!("   Completed: {}/{} ({:.1}%)", report.completed, report.total, report.completed_fraction() * 100.0);
    println!("   Failed: {}, cancelled: {}", report.failed, report.cancelled);
    println!("   Elapsed: {:?}\n", start.elapsed());

    engine.wait_idle(Duration::from_secs(60));

    // Rewards
    let start = Instant::now();
    let report = engine
        .calculate_rewards_for_all(&users)
        .expect("engine is running")
        .wait_timeout(Duration::from_secs(20 * 60));
    let rewarded = users.iter().filter(|u| u.reward_count() > 0).count();
    println!("2. calculate_rewards_for_all: {:?}", report.state);
    println!("   Completed: {}/{}", report.completed, report.total);
    println!("   Users with at least one reward: {}", rewarded);
    println!("   Elapsed: {:?}\n", start.elapsed());

    let stats = engine.cache().stats();
    println!("Cache: {} entries, {} hits, {} misses, {} provider calls",
        stats.entries, stats.hits, stats.misses, stats.provider_calls);
    println!("Pool: {} tasks ran on the submitting thread", engine.pool().caller_runs());

    let shutdown = engine.shutdown();
    println!("Shutdown: drained={} in {:?}", shutdown.drained, shutdown.waited);
}
