//! Downloads the local recognition model ahead of time.
//!
//! Usage: fetch-model [model]

use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tara_core::{ConfigManager, models_dir};
use tara_recognize::{HttpModelFetcher, MirrorPolicy, WhisperModel, fetch_from_mirrors};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    let config = ConfigManager::new()?.load()?;
    let name = args.get(1).map(String::as_str).or(config.model());

    let model = match name {
        Some(name) => match WhisperModel::from_name(name) {
            Some(model) => model,
            None => {
                eprintln!("Unknown model: {}", name);
                eprintln!("Available models: {}", WhisperModel::all_names().join(", "));
                std::process::exit(1);
            }
        },
        None => WhisperModel::default(),
    };

    let fetcher = HttpModelFetcher::new(model, models_dir()?);
    if let Some(path) = fetcher.cached() {
        println!("Model {} is already available at {}", model.name(), path.display());
        return Ok(());
    }

    let policy = MirrorPolicy {
        probe: true,
        probe_timeout: config.probe_timeout(),
        source_timeout: config.source_timeout(),
        global_timeout: config.download_timeout(),
    };
    let sources = model.sources(config.model_mirrors());

    println!("Downloading {} ({})", model.name(), model.size_human());
    for source in &sources {
        println!("  mirror: {}", source);
    }

    let last_percent = AtomicU64::new(u64::MAX);
    let progress = |downloaded: u64, total: u64| {
        let percent = if total > 0 { downloaded * 100 / total } else { 0 };
        if last_percent.swap(percent, Ordering::Relaxed) != percent && percent % 10 == 0 {
            println!("  {}%", percent);
        }
    };

    let start = Instant::now();
    match fetch_from_mirrors(&fetcher, &sources, &policy, &progress).await {
        Ok(fetched) => {
            println!(
                "Downloaded from {} in {:.1}s to {}",
                fetched.source,
                start.elapsed().as_secs_f64(),
                fetched.value.display()
            );
            Ok(())
        }
        Err(failure) => {
            eprintln!("{}", failure.error.user_message());
            eprintln!("Last error: {}", failure.error);
            if !failure.reachable {
                eprintln!("None of the mirrors answered the existence check.");
            }
            std::process::exit(1);
        }
    }
}
