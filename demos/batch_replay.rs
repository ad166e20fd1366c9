//! Replay a synthetic day of tourist traffic through the batch path.
//!
//! Warm-starts the pattern model from generated history, then checks a batch
//! that mixes ordinary walkers with a few teleporting and loitering devices.
//!
//! Run with: RUST_LOG=info cargo run --example batch_replay --features parallel

use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;
use tourist_anomaly::{AnomalyEngine, AnomalyKind, EngineConfig, GpsFix, GpsPoint, Status};

const ROUTE_START: (f64, f64) = (12.9716, 77.5946);
const ROUTE_END: (f64, f64) = (12.9756, 77.5986);

/// A tourist walking the route back and forth with a little GPS noise.
fn walker(rng: &mut StdRng, tourist_id: i64, start: DateTime<Utc>, fixes: usize) -> Vec<GpsFix> {
    let mut t = start;
    (0..fixes)
        .map(|i| {
            let phase = (i % 40) as f64 / 40.0;
            let progress = if (i / 40) % 2 == 0 { phase } else { 1.0 - phase };
            let lat = ROUTE_START.0 + (ROUTE_END.0 - ROUTE_START.0) * progress + rng.gen_range(-0.00005..0.00005);
            let lon = ROUTE_START.1 + (ROUTE_END.1 - ROUTE_START.1) * progress + rng.gen_range(-0.00005..0.00005);
            t += Duration::seconds(rng.gen_range(45..90));
            GpsFix::new(tourist_id, GpsPoint::new(lat, lon), t)
        })
        .collect()
}

fn main() {
    env_logger::init();

    let mut rng = StdRng::seed_from_u64(7);
    let engine = match AnomalyEngine::new(EngineConfig::default()) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("bad config: {}", e);
            return;
        }
    };

    println!("Batch Replay Example\n");

    // Yesterday's traffic seeds the pattern model
    let yesterday = Utc.with_ymd_and_hms(2024, 1, 14, 9, 0, 0).unwrap();
    let history: Vec<GpsFix> = (1000..1040)
        .flat_map(|id| walker(&mut rng, id, yesterday, 60))
        .collect();
    let start = Instant::now();
    let stored = engine.preload(history);
    println!("Preloaded {} fixes in {:?}", stored, start.elapsed());
    println!("Model version: {}\n", engine.health().model_version);

    // Today's batch: 50 walkers, interleaved by time
    let today = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
    let mut batch: Vec<GpsFix> = (1..=50).flat_map(|id| walker(&mut rng, id, today, 30)).collect();

    // Tourist 51 jumps across town between two fixes
    batch.push(GpsFix::new(51, GpsPoint::new(12.9716, 77.5946), today));
    batch.push(GpsFix::new(51, GpsPoint::new(13.0500, 77.6500), today + Duration::seconds(30)));

    // Tourist 52 sits on a bench for ten minutes
    for minute in 0..=10 {
        batch.push(GpsFix::new(52, GpsPoint::new(12.9736, 77.5966), today + Duration::minutes(minute)));
    }

    batch.sort_by_key(|f| f.timestamp);

    let start = Instant::now();
    let results = engine.evaluate_batch(batch);
    let elapsed = start.elapsed();
    println!("Checked {} fixes in {:?}\n", results.len(), elapsed);

    let mut flagged = 0;
    for verdict in results.iter().filter_map(|r| r.as_ref().ok()) {
        if verdict.status() == Status::Anomaly {
            flagged += 1;
            if verdict.fix.tourist_id > 50 {
                let kinds: Vec<AnomalyKind> = verdict.anomalies.iter().map(|a| a.kind).collect();
                println!("  tourist {} at {}: {:?}", verdict.fix.tourist_id, verdict.fix.timestamp, kinds);
            }
        }
    }
    let rejected = results.iter().filter(|r| r.is_err()).count();

    let stats = engine.stats();
    println!("\nStats:");
    println!("  Fixes checked: {}", stats.total_fixes);
    println!("  Anomalous fixes: {} ({}%)", flagged, stats.anomaly_rate);
    println!("  Rejected fixes: {}", rejected);
    for (kind, count) in &stats.anomalies_by_type {
        println!("  {}: {}", kind, count);
    }
}
