use clap::Parser;
use hpcan::{Config, Engine, ParameterKey, discovery::cache::FileCacheStore};
use std::{error::Error, path::PathBuf, time::Duration};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Parameter name or index (e.g. `GT3_TEMP` or `782`)
    parameter: String,

    /// Value to write through the command queue instead of reading
    #[arg(short, long)]
    write: Option<String>,

    /// Serial port path
    #[arg(short, long, default_value = "/dev/ttyACM0")]
    port: String,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Element cache file
    #[arg(long, default_value = "elements.json")]
    cache: PathBuf,

    /// Read timeout in milliseconds
    #[arg(short, long, default_value = "2000")]
    timeout: u64,

    /// Ignore a fresh element cache and query the device
    #[arg(short, long, default_value = "false")]
    refresh: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    config.discovery.force_refresh |= args.refresh;

    let store = FileCacheStore::new(config.cache_path.clone().unwrap_or(args.cache));
    let port = hpcan::serial::open(&args.port, config.transport.baud_rate)?;
    let engine = Engine::start(port, &config, &store).await?;

    println!("Using index table from {} source", engine.source());

    if let Some(value) = &args.write {
        engine.queue().enqueue(&args.parameter, value)?;

        if let Some(res) = engine.queue().process_one().await {
            println!("{}: {} ({})", res.entity, res.status, res.message);
        }
    } else {
        let Ok(key) = args.parameter.parse::<ParameterKey>();

        match engine
            .client()
            .read_parameter(key, Duration::from_millis(args.timeout))
            .await
        {
            Ok(reading) => println!(
                "{} (index {}, {}): {} raw {:02x?}",
                reading.name, reading.idx, reading.format, reading.value, reading.raw
            ),
            Err(err) => println!("{}: {err}", args.parameter),
        }
    }

    engine.shutdown().await;

    Ok(())
}
