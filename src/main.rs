// src/main.rs
// Demo entry point: runs a scenario against the simulated kitting cell and
// prints what got shipped.
//
// Usage: gantry_kitting <scenario.yaml> [cell.yaml]
// Verbosity follows RUST_LOG (e.g. RUST_LOG=info).

use std::error::Error;

use gantry_kitting::CellConfig;
use gantry_kitting::sim::{Scenario, SimCell};
use log::{error, info};

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(scenario_path) = args.next() else {
        error!("No scenario given");
        eprintln!("usage: gantry_kitting <scenario.yaml> [cell.yaml]");
        std::process::exit(2);
    };
    let config = match args.next() {
        Some(path) => CellConfig::from_yaml_file(path)?,
        None => {
            info!("No cell configuration given, using the stock layout");
            CellConfig::default()
        }
    };
    let scenario = Scenario::from_yaml_file(&scenario_path)?;

    let cell = SimCell::new(&config, &scenario);
    let scheduler = cell.scheduler(config);
    // The node owns the publisher handle and must outlive the run
    #[cfg(feature = "ros")]
    let mut node = r2r::Node::create(r2r::Context::create()?, "gantry_kitting", "")?;
    #[cfg(feature = "ros")]
    let scheduler = {
        let status = gantry_kitting::ros_interface::StatusPublisher::new(&mut node, "/kitting/status")?;
        info!("Publishing fulfillment events on /kitting/status");
        scheduler.with_events(status)
    };
    let mut scheduler = scheduler;

    info!("Running {}", scenario_path);
    let summary = scheduler.run();

    println!("completed shipments: {}", summary.completed.len());
    for submission in &summary.submissions {
        println!(
            "  {} on {}: {}",
            submission.label,
            submission.agv,
            if submission.success { "submitted" } else { "rejected" }
        );
    }
    println!(
        "placements: {}, corrected: {}, discarded: {}",
        summary.placements, summary.corrected, summary.discarded
    );
    if !summary.unfinished.is_empty() {
        println!("unfinished: {}", summary.unfinished.join(", "));
    }
    if summary.cancelled {
        println!("run was cancelled");
    }
    Ok(())
}
