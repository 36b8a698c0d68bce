//! Inspect calibration for a target rate and, optionally, an anchor directory

use calibration::{AnchorStore, DensityParameters, FileAnchorStore, SimulatedClock};
use std::env;
use std::path::Path;

fn main() {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: anchor <target_tps> [anchor_dir] [warehouses]");
        std::process::exit(1);
    }

    let rate: f64 = match args[1].parse() {
        Ok(rate) => rate,
        Err(_) => {
            eprintln!("target_tps must be a number, got {}", args[1]);
            std::process::exit(1);
        }
    };

    let params = match DensityParameters::new(rate) {
        Ok(params) => params,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };

    println!("=== Density ===");
    match serde_json::to_string_pretty(&params) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("cannot render parameters: {}", e),
    }

    let Some(dir) = args.get(2) else {
        return;
    };
    let warehouses: u32 = args.get(3).and_then(|w| w.parse().ok()).unwrap_or(1);

    let path = FileAnchorStore::file_path(Path::new(dir));
    println!("\n=== Anchors ({}) ===", path.display());
    let anchors = match FileAnchorStore::new().read(Path::new(dir)) {
        Ok(anchors) => anchors,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    println!("startLoadTimestamp: {}", anchors.start_load);
    println!("lastLoadTimestamp:  {}", anchors.last_load);
    println!(
        "Populated span: {:.1} s",
        (anchors.last_load - anchors.start_load) as f64 / 1000.0
    );

    let clock = SimulatedClock::resume(&params, warehouses, false, anchors);
    let range = clock.reference_range();
    println!("\n=== Reference mapping ===");
    println!(
        "{} -> {}",
        range.start_ms(),
        clock.map_reference_timestamp(range.start_ms())
    );
    println!(
        "{} -> {}",
        range.end_ms(),
        clock.map_reference_timestamp(range.end_ms())
    );
    println!(
        "Expected final populated timestamp ({} warehouses): {}",
        warehouses,
        SimulatedClock::populating_from(&params, warehouses, anchors.start_load)
            .final_populated_timestamp()
    );
}
