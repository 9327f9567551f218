//! mayausd - load a USD file through a proxy shape and report on it

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use mayausd::proxy_shape::attr;
use mayausd::usd::{Prim, TimeCode};
use mayausd::{MayaUsdConfig, PluginHost};

/// Resolve a USD stage the way a proxy shape does and print what it sees
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// USD file to load
    #[arg(value_name = "FILE")]
    file: PathBuf,

    /// Prim to root the shape at
    #[arg(long)]
    prim_path: Option<String>,

    /// Time code for the bounding box
    #[arg(long, short = 't')]
    time: Option<f64>,

    /// Config file (defaults to $MAYAUSD_CONFIG, then the user config dir)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn print_hierarchy(prim: &Prim, depth: usize) {
    let type_name = prim.type_name().unwrap_or_default();
    if depth == 0 {
        println!("{}", prim.path());
    } else {
        println!("{}{} ({})", "  ".repeat(depth), prim.name(), type_name);
    }
    for child in prim.children() {
        print_hierarchy(&child, depth + 1);
    }
}

fn run(args: Args) -> mayausd::Result<bool> {
    let config = match &args.config {
        Some(path) => MayaUsdConfig::load_from(path)?,
        None => MayaUsdConfig::load()?,
    };
    mayausd::init_logging(&config.log_filter);

    let host = PluginHost::new(config);
    host.initialize();

    let shape = host.create_proxy_shape("stage")?;
    let graph = host.graph();
    graph.set_value(shape, attr::FILE_PATH, args.file.to_string_lossy().into_owned())?;
    if let Some(prim_path) = &args.prim_path {
        graph.set_value(shape, attr::PRIM_PATH, prim_path.as_str())?;
    }
    if let Some(time) = args.time {
        graph.set_value(shape, attr::TIME, TimeCode::new(time))?;
    }

    let Some(proxy) = host.proxy_shape(shape) else {
        return Ok(false);
    };
    if !proxy.is_stage_valid() {
        log::error!("Could not load a stage from {}", args.file.display());
        return Ok(false);
    }

    print_hierarchy(&proxy.usd_prim(), 0);

    let bounds = proxy.bounding_box();
    if bounds.is_empty() {
        println!("bounds: empty");
    } else {
        println!("bounds: min {} max {}", bounds.min, bounds.max);
    }
    println!("stage cache id: {}", proxy.stage_cache_id());

    host.uninitialize();
    Ok(true)
}

fn main() -> ExitCode {
    match run(Args::parse()) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("mayausd: {}", err);
            ExitCode::FAILURE
        }
    }
}
