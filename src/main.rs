mod cli;

use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use streamscope::analysis::{FlagTagger, HttpNormalizer};
use streamscope::capture::live::{self, LiveSettings};
use streamscope::capture::offline::{self, FileStatus};
use streamscope::capture::upload::{KeepLocal, SpoolUploader, Uploader};
use streamscope::capture::{engine, watcher, CaptureContext};
use streamscope::config::{Config, ConfigError};
use streamscope::pipeline::{FileQueue, FlowChain};
use streamscope::store::{FlowFiles, JsonlStore};

fn main() {
    let args = cli::Cli::parse();

    // Initialize tracing/logging
    let log_level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    // Handle --list-interfaces
    if args.list_interfaces {
        list_interfaces();
        return;
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error: {}", err);
            std::process::exit(1);
        }
    };

    let Some(command) = &args.command else {
        eprintln!("error: no command given (offline, watch or live); see --help");
        std::process::exit(2);
    };

    // Set up Ctrl-C handler
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        running_clone.store(false, Ordering::SeqCst);
        eprintln!("\nInterrupt received, finishing current work...");
    }) {
        eprintln!("error: failed to set Ctrl-C handler: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(command, &config, running) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

/// List available network interfaces and print them.
fn list_interfaces() {
    match engine::list_interfaces() {
        Ok(devices) => {
            println!("Available network interfaces:");
            println!("{:<20} {:<20} {}", "Name", "Description", "Addresses");
            println!("{}", "-".repeat(70));
            for device in &devices {
                let desc = device.desc.as_deref().unwrap_or("");
                let addrs: Vec<String> = device
                    .addresses
                    .iter()
                    .map(|a| format!("{}", a.addr))
                    .collect();
                println!("{:<20} {:<20} {}", device.name, desc, addrs.join(", "));
            }
            if devices.is_empty() {
                println!("  (no interfaces found, try running with sudo)");
            }
        }
        Err(e) => {
            eprintln!("error listing interfaces: {}", e);
            eprintln!("hint: try running with sudo");
        }
    }
}

/// File configuration with command-line values on top.
fn load_config(args: &cli::Cli) -> Result<Config, ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(value) = &args.filter {
        config.capture.filter = Some(value.clone()).filter(|f| !f.trim().is_empty());
    }
    if let Some(value) = &args.flag_regex {
        config.tagging.flag_regex = Some(value.clone()).filter(|f| !f.trim().is_empty());
    }
    if args.strict {
        config.reassembly.strict = true;
    }
    if let Some(value) = &args.flow_dir {
        config.storage.flow_dir = value.clone();
    }
    if let Some(value) = &args.state_dir {
        config.storage.state_dir = value.clone();
    }

    match &args.command {
        Some(cli::Command::Watch { dir, workers }) => {
            if let Some(value) = dir {
                config.watch.dir = Some(value.clone());
            }
            if let Some(value) = workers {
                config.watch.workers = *value;
            }
        }
        Some(cli::Command::Live {
            interface,
            round_secs,
            snaplen,
            no_promiscuous,
            spool_dir,
        }) => {
            if let Some(value) = interface {
                config.live.interface = Some(value.clone());
            }
            if let Some(value) = round_secs {
                config.live.round_secs = *value;
            }
            if let Some(value) = snaplen {
                config.capture.snaplen = *value;
            }
            if *no_promiscuous {
                config.capture.promiscuous = false;
            }
            if let Some(value) = spool_dir {
                config.live.spool_dir = Some(value.clone());
            }
        }
        Some(cli::Command::Offline { .. }) | None => {}
    }

    Ok(config)
}

fn build_context(config: &Config, running: Arc<AtomicBool>) -> Result<CaptureContext, Box<dyn std::error::Error>> {
    let tagger = match &config.tagging.flag_regex {
        Some(pattern) => Some(Arc::new(FlagTagger::new(pattern).map_err(ConfigError::FlagPattern)?)),
        None => None,
    };
    let store = Arc::new(JsonlStore::open(&config.storage.state_dir)?);
    let chain = FlowChain::new(
        HttpNormalizer::new(config.reassembly.max_flow_size),
        tagger,
        FlowFiles::new(&config.storage.flow_dir),
        store,
    );

    Ok(CaptureContext {
        chain: Arc::new(chain),
        ingest: config.ingest_settings(),
        udp: config.udp_config(),
        filter: config.capture.filter.clone(),
        running,
    })
}

fn run(command: &cli::Command, config: &Config, running: Arc<AtomicBool>) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = build_context(config, running)?;

    println!("streamscope v{}", env!("CARGO_PKG_VERSION"));
    if let Some(filter) = &ctx.filter {
        println!("Filter: {}", filter);
    }
    if let Some(pattern) = &config.tagging.flag_regex {
        println!("Flag pattern: {}", pattern);
    }

    match command {
        cli::Command::Offline { files } => run_offline(files, &ctx),
        cli::Command::Watch { .. } => run_watch(config, ctx),
        cli::Command::Live { .. } => run_live(config, &ctx),
    }
}

fn run_offline(files: &[PathBuf], ctx: &CaptureContext) -> Result<(), Box<dyn std::error::Error>> {
    let mut failures = 0usize;
    let (mut flows, mut packets) = (0u64, 0u64);
    for path in files {
        if !ctx.running.load(Ordering::SeqCst) {
            break;
        }
        match offline::process_file(path, ctx) {
            Ok(report) => {
                let status = match report.status {
                    FileStatus::AlreadyProcessed => "already processed",
                    FileStatus::Complete => "done",
                    FileStatus::Partial => "partial, will be retried",
                };
                println!(
                    "{}: {} ({} packets, {} flows, {} failed)",
                    path.display(),
                    status,
                    report.stats.packets,
                    report.persisted,
                    report.failed
                );
                flows += report.persisted;
                packets += report.stats.packets;
            }
            Err(e) => {
                failures += 1;
                eprintln!("error: {}: {}", path.display(), e);
            }
        }
    }

    println!();
    println!("{}", "=".repeat(50));
    println!("Processing complete.");
    println!("  Files:             {}", files.len());
    println!("  Packets:           {}", packets);
    println!("  Flows persisted:   {}", flows);
    println!("  Failed files:      {}", failures);
    println!("{}", "=".repeat(50));

    if failures > 0 {
        return Err(format!("{} of {} files could not be processed", failures, files.len()).into());
    }
    Ok(())
}

fn run_watch(config: &Config, ctx: CaptureContext) -> Result<(), Box<dyn std::error::Error>> {
    let dir = config
        .watch
        .dir
        .clone()
        .ok_or("no watch directory given (argument or [watch] dir)")?;
    let running = ctx.running.clone();

    println!("Watching {} (Ctrl-C to stop)...", dir.display());

    let queue = FileQueue::spawn(
        config.watch.workers,
        config.watch.queue_capacity,
        running.clone(),
        move |path: &std::path::Path| {
            if let Err(e) = offline::process_file(path, &ctx) {
                tracing::error!(file = %path.display(), error = %e, "failed to process capture file");
            }
        },
    )?;
    let result = watcher::watch(&dir, config.watch.settle(), &queue, &running);
    queue.shutdown();
    result?;
    Ok(())
}

fn run_live(config: &Config, ctx: &CaptureContext) -> Result<(), Box<dyn std::error::Error>> {
    let settings = LiveSettings {
        interface: config.live.interface.clone(),
        options: config.live_options(),
        round: Duration::from_secs(config.live.round_secs.max(1)),
        out_dir: config.live.out_dir.clone(),
    };
    let uploader: Box<dyn Uploader> = match &config.live.spool_dir {
        Some(dir) => Box::new(SpoolUploader::new(dir)?),
        None => Box::new(KeepLocal),
    };

    println!(
        "Capturing on {} in {}s rounds (Ctrl-C to stop)...",
        settings.interface.as_deref().unwrap_or("all interfaces"),
        settings.round.as_secs()
    );
    live::run(&settings, ctx, uploader.as_ref())?;
    Ok(())
}
