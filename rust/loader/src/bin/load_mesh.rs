// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CLI tool: load a mesh file in the background and print load statistics
//!
//! Usage:
//!   load-mesh <file> [options]

use anyhow::{anyhow, bail, Context, Result};
use ifc_lite_loader::{BackgroundLoader, LoadError, LoadedModel, LoaderConfig};
use std::env;
use std::sync::Arc;
use std::time::Duration;

type Outcome = (Option<Arc<LoadedModel>>, Option<LoadError>);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            env::var("RUST_LOG").unwrap_or_else(|_| "info,ifc_lite_loader=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage();
        return Ok(());
    }

    let path = &args[1];
    let mut config = LoaderConfig::from_env();
    let mut json = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--workers" => {
                config.worker_threads = option_value(&args, &mut i)?.parse().context("Invalid workers value")?;
            }
            "--chunk-size-mb" => {
                let mb: u64 = option_value(&args, &mut i)?.parse().context("Invalid chunk size")?;
                config.base_chunk_size = mb.max(1) * 1024 * 1024;
            }
            "--strategy" => {
                let strategy = option_value(&args, &mut i)?.parse().map_err(|e: String| anyhow!(e))?;
                config.forced_strategy = Some(strategy);
            }
            "--timeout-secs" => {
                let secs: u64 = option_value(&args, &mut i)?.parse().context("Invalid timeout")?;
                config.chunk_timeout = Duration::from_secs(secs);
            }
            "--json" => json = true,
            other => {
                print_usage();
                bail!("Unknown option: {}", other);
            }
        }
        i += 1;
    }

    rayon::ThreadPoolBuilder::new()
        .num_threads(config.worker_threads.max(1))
        .build_global()
        .context("Failed to initialize rayon thread pool")?;

    tracing::info!(
        path = %path,
        worker_threads = config.worker_threads,
        chunk_size_mb = config.base_chunk_size / (1024 * 1024),
        strategy = ?config.forced_strategy,
        "Loading mesh"
    );

    let loader = BackgroundLoader::new(config);
    let (tx, rx) = crossbeam_channel::bounded::<Outcome>(1);
    let quiet = json;

    loader.submit(
        path.as_str(),
        move |percent, message| {
            if !quiet {
                eprintln!("[{:>3}%] {}", percent, message);
            }
        },
        move |_id, model, error| {
            let _ = tx.send((model, error));
        },
    )?;

    let (model, error) = rx.recv().context("Load job ended without a result")?;

    if let Some(error) = error {
        eprintln!("Error [{}]: {}", error.code(), error);
        for suggestion in error.suggestions() {
            eprintln!("  - {}", suggestion);
        }
        std::process::exit(1);
    }
    let model = model.ok_or_else(|| anyhow!("Load finished without a model"))?;

    if json {
        let report = serde_json::json!({
            "path": path,
            "bounds": model.bounds,
            "stats": model.stats,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let stats = &model.stats;
        println!("File:       {}", path);
        println!("Triangles:  {}", stats.total_triangles);
        println!("Vertices:   {}", stats.total_vertices);
        println!("Chunks:     {}", stats.chunk_count);
        if let Some(strategy) = stats.strategy {
            println!("Strategy:   {}", strategy);
        }
        if model.bounds.is_valid() {
            let [x, y, z] = model.bounds.size();
            println!("Size:       {:.3} x {:.3} x {:.3}", x, y, z);
        }
        println!(
            "Time:       {} ms (chunking {} ms, parsing {} ms, aggregation {} ms)",
            stats.total_time_ms, stats.chunking_time_ms, stats.parse_time_ms, stats.aggregate_time_ms
        );
    }

    Ok(())
}

fn option_value<'a>(args: &'a [String], i: &mut usize) -> Result<&'a str> {
    let name = &args[*i];
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| anyhow!("Missing value for {}", name))
}

fn print_usage() {
    eprintln!("load-mesh - load a large mesh file in parallel chunks");
    eprintln!();
    eprintln!("Usage: load-mesh <file> [options]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --workers <n>         Chunks parsed at once (default: CPU cores)");
    eprintln!("  --chunk-size-mb <n>   Base chunk size in MiB (default: 64)");
    eprintln!("  --strategy <name>     fixed_size, adaptive_size, format_aware or memory_constrained");
    eprintln!("  --timeout-secs <n>    Per-chunk timeout (default: 30)");
    eprintln!("  --json                Print statistics as JSON");
    eprintln!();
    eprintln!("Environment: RUST_LOG and LOADER_* variables (see LoaderConfig)");
}
