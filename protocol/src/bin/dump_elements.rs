use clap::Parser;
use hpcan::{
    CanTransport, Config,
    discovery::{
        ElementDiscovery,
        cache::{CacheSnapshot, CacheStore, FileCacheStore},
    },
};
use std::{error::Error, path::PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial port path
    #[arg(short, long, default_value = "/dev/ttyACM0")]
    port: String,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output filename for the element cache
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Override the completeness threshold (e.g. `0.9`)
    #[arg(short, long)]
    threshold: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(threshold) = args.threshold {
        config.discovery.completeness_threshold = threshold;
    }

    config.validate()?;

    let output = args
        .output
        .or_else(|| config.cache_path.clone())
        .unwrap_or_else(|| "elements.json".into());
    let port = hpcan::serial::open(&args.port, config.transport.baud_rate)?;
    let transport = CanTransport::new(config.transport.clone());

    transport.connect(port).await?;

    let res = ElementDiscovery::new(&transport, &config.discovery)
        .discover_with_retries()
        .await;

    transport.disconnect().await;

    let report = res?;

    for elem in &report.elements {
        println!(
            "{:4} {} {:<32} [{}, {}]",
            elem.idx, elem.ext_id, elem.name, elem.min, elem.max
        );
    }

    println!(
        "Received {} of {} reported bytes, {} element(s), {} byte(s) skipped",
        report.actual_bytes,
        report.reported_bytes,
        report.elements.len(),
        report.skipped_bytes
    );

    FileCacheStore::new(&output).save(&CacheSnapshot::from_report(&report))?;

    println!("Wrote element cache to {}", output.display());

    Ok(())
}
