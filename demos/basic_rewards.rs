//! Basic example of tracking a user and collecting rewards.
//!
//! Run with: cargo run --example basic_rewards

use std::sync::Arc;

use reward_tracker::simulation::{SimulatedGps, SimulatedRewardCentral, StaticCatalog};
use reward_tracker::{Coordinate, EngineConfig, RewardEngine, User};
use uuid::Uuid;

fn main() {
    // Pretend the user is standing in front of Disneyland
    let gps = Arc::new(SimulatedGps::at(Coordinate::new(33.817595, -117.922008)));
    let scoring = Arc::new(SimulatedRewardCentral::instant());

    let engine = RewardEngine::new(gps, scoring, &StaticCatalog::sample(), EngineConfig::default())
        .expect("engine should start");

    let jon = Arc::new(User::new(Uuid::new_v4(), "jon", "000", "jon@example.com"));

    println!("Reward Tracking Example\n");
    println!("Config: tracking_threshold={} mi, attraction_proximity={} mi\n",
        engine.config().tracking_threshold_miles, engine.config().attraction_proximity_miles);

    // Track and wait for rewards
    println!("1. Track jon and compute rewards:");
    match engine.track_and_reward(&jon) {
        Ok((location, outcome)) => {
            println!("   Location: ({:.4}, {:.4})", location.coordinate.latitude, location.coordinate.longitude);
            println!("   New rewards: {}\n", outcome.awarded);
        }
        Err(e) => println!("   Tracking failed: {}\n", e),
    }

    // Tracking again at the same spot earns nothing new
    println!("2. Track jon again at the same spot:");
    match engine.track_and_reward(&jon) {
        Ok((_, outcome)) => println!("   New rewards: {}\n", outcome.awarded),
        Err(e) => println!("   Tracking failed: {}\n", e),
    }

    println!("3. Rewards held by jon:");
    for reward in jon.rewards() {
        println!("   {} ({}, {}): {} points",
            reward.attraction.name, reward.attraction.city, reward.attraction.state, reward.points);
    }
    println!("   Total: {} points\n", jon.total_reward_points());

    println!("4. Closest attractions:");
    match engine.nearby_attractions(&jon) {
        Ok(nearby) => {
            for n in nearby {
                let points = n.reward_points.map_or("-".to_string(), |p| p.to_string());
                println!("   {:<30} {:>8.1} mi  {:>5} points", n.attraction.name, n.distance_miles, points);
            }
        }
        Err(e) => println!("   Lookup failed: {}", e),
    }

    engine.shutdown();
}
