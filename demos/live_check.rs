//! Walk through single-fix checks against the default Bangalore route.
//!
//! Run with: RUST_LOG=info cargo run --example live_check

use tourist_anomaly::{AnomalyEngine, EngineConfig, FixRequest};

fn request(tourist_id: i64, lat: f64, lon: f64, timestamp: &str) -> FixRequest {
    FixRequest {
        tourist_id,
        lat,
        lon,
        timestamp: timestamp.to_string(),
        emergency: false,
    }
}

fn print_check(engine: &AnomalyEngine, request: &FixRequest) {
    match engine.check_anomaly(request) {
        Ok(response) => match serde_json::to_string_pretty(&response) {
            Ok(json) => println!("{}\n", json),
            Err(e) => println!("   serialization failed: {}\n", e),
        },
        Err(e) => println!("   rejected: {}\n", e),
    }
}

fn main() {
    env_logger::init();

    let config = EngineConfig::default();
    println!("Tourist Anomaly Checks\n");
    println!(
        "Config: deviation={}m, stop={}min within {}m, {} route waypoints\n",
        config.route.deviation_threshold_meters,
        config.stop.stop_threshold_minutes,
        config.stop.proximity_radius_meters,
        config.route.planned_route.len()
    );

    let engine = match AnomalyEngine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("bad config: {}", e);
            return;
        }
    };

    // On the planned route
    println!("1. Tourist 1 at the route start:");
    print_check(&engine, &request(1, 12.9716, 77.5946, "2024-01-15T10:30:00"));

    // ~512m off the route
    println!("2. Tourist 1 five minutes later, off route:");
    print_check(&engine, &request(1, 12.9800, 77.6000, "2024-01-15T10:35:00"));

    // Six fixes at one spot, a minute apart; only the last one is reported
    println!("3. Tourist 2 standing still:");
    for minute in 0..6 {
        let ts = format!("2024-01-15T10:{:02}:00", 30 + minute);
        let response = engine.check_anomaly(&request(2, 12.9736, 77.5966, &ts));
        match response {
            Ok(r) => println!("   {} -> {:?} {}", ts, r.status, r.reason.unwrap_or_default()),
            Err(e) => println!("   {} -> rejected: {}", ts, e),
        }
    }
    println!();

    // Stale timestamps are rejected, not reordered
    println!("4. Tourist 2 replaying an old fix:");
    print_check(&engine, &request(2, 12.9736, 77.5966, "2024-01-15T10:31:00"));

    let history = engine.history_response(2);
    println!("History for tourist 2: {} points", history.total_points);

    match serde_json::to_string_pretty(&engine.stats()) {
        Ok(json) => println!("\nStats:\n{}", json),
        Err(e) => println!("\nStats unavailable: {}", e),
    }
}
