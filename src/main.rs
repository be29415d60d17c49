//! FlashRelay - A Local-Side Redis Protocol Relayer
//!
//! The binary entry point: parses the few flags it takes, sets up logging,
//! builds the configured relay, and runs it until a shutdown signal drains
//! everything.

use flashrelay::relay::{fs::FsRelay, queue::QueueRelay, redis::RedisRelay};
use flashrelay::spool::{BatchEntry, BatchSink};
use flashrelay::{Mode, Protocol, RelayerConfig};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Command-line configuration
struct Args {
    config: RelayerConfig,
    verbose: bool,
}

impl Args {
    /// Parse configuration from command-line arguments
    fn parse() -> Args {
        let mut config = RelayerConfig {
            listen: format!("{}:{}", flashrelay::DEFAULT_HOST, flashrelay::DEFAULT_PORT),
            ..Default::default()
        };
        let mut verbose = false;

        let argv: Vec<String> = std::env::args().collect();
        let mut i = 1;
        while i < argv.len() {
            let (flag, value) = (argv[i].as_str(), argv.get(i + 1));
            match flag {
                "--listen" | "-l" => {
                    config.listen = expect_value(flag, value);
                    i += 2;
                }
                "--url" | "-u" => {
                    config.url = expect_value(flag, value);
                    i += 2;
                }
                "--protocol" => {
                    let v = expect_value(flag, value);
                    config.protocol = Protocol::parse(&v).unwrap_or_else(|| {
                        eprintln!("Error: unknown protocol '{}'", v);
                        std::process::exit(1);
                    });
                    i += 2;
                }
                "--mode" | "-m" => {
                    config.mode = Mode::parse(&expect_value(flag, value));
                    i += 2;
                }
                "--path" => {
                    config.path = expect_value(flag, value);
                    i += 2;
                }
                "--shards" => {
                    config.shards = parse_num(flag, value);
                    i += 2;
                }
                "--writers" => {
                    config.writers = parse_num::<usize>(flag, value);
                    i += 2;
                }
                "--max-connections" => {
                    config.max_connections = parse_num::<usize>(flag, value);
                    i += 2;
                }
                "--buffer" => {
                    config.buffer = parse_num::<usize>(flag, value);
                    i += 2;
                }
                "--compress" => {
                    config.compress = true;
                    i += 1;
                }
                "--verbose" | "-v" => {
                    verbose = true;
                    i += 1;
                }
                "--version" => {
                    println!("flashrelay {}", flashrelay::VERSION);
                    std::process::exit(0);
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {}", other);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Args { config, verbose }
    }
}

fn expect_value(flag: &str, value: Option<&String>) -> String {
    match value {
        Some(v) => v.clone(),
        None => {
            eprintln!("Error: {} requires a value", flag);
            std::process::exit(1);
        }
    }
}

fn parse_num<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> T {
    expect_value(flag, value).parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid value for {}", flag);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
FlashRelay - A Local-Side Redis Protocol Relayer

USAGE:
    flashrelay [OPTIONS]

OPTIONS:
    -l, --listen <ADDR>        Local endpoint (host:port or unix:///path)
    -u, --url <ADDR>           Backend endpoint (redis protocol)
        --protocol <NAME>      redis | fs | queue (default: redis)
    -m, --mode <MODE>          sync | smart (default: sync)
        --path <DIR>           Archive base directory (fs protocol)
        --shards <N>           Archive shard count (fs protocol)
        --writers <N>          Writers per shard (fs protocol)
        --max-connections <N>  Backend pool / worker bound
        --buffer <N>           Intake channel capacity
        --compress             Gzip archived payloads
    -v, --verbose              Debug logging
        --version              Print version information
        --help                 Print this help message

EXAMPLES:
    flashrelay -l 127.0.0.1:6389 -u 10.0.0.5:6379 -m smart
    flashrelay -l unix:///tmp/relay.sock -u 10.0.0.5:6379
    flashrelay --protocol fs -l 127.0.0.1:6390 --path /data/archive --shards 64
"#
    );
}

/// Logging sink for queue batches when no real transport is wired in.
struct LogSink;

impl BatchSink for LogSink {
    async fn send_batch(&self, batch: Vec<BatchEntry>) -> anyhow::Result<()> {
        let bytes: usize = batch.iter().map(|e| e.body.len()).sum();
        info!(records = batch.len(), bytes, "Batch shipped");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .init();

    info!(
        version = flashrelay::VERSION,
        listen = %args.config.listen,
        "FlashRelay starting"
    );

    let (done_tx, mut done_rx) = mpsc::channel(1);

    // One relay per process from the CLI; richer topologies come from the
    // embedding layer driving the library directly.
    let cfg = args.config;
    match cfg.protocol {
        Protocol::Redis => {
            let relay = RedisRelay::new(cfg, done_tx);
            relay.start().await?;
            wait_for_shutdown().await;
            relay.exit();
        }
        Protocol::Fs => {
            let relay = FsRelay::new(cfg, None, done_tx).await;
            relay.start().await?;
            wait_for_shutdown().await;
            relay.exit().await;
        }
        Protocol::Queue => {
            let relay = QueueRelay::new(cfg, LogSink, done_tx);
            relay.start().await?;
            wait_for_shutdown().await;
            relay.exit().await;
        }
    }

    if done_rx.recv().await.is_none() {
        error!("Relay ended without signalling done");
    }
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, draining..."),
        Err(e) => error!(error = %e, "Failed to install signal handler"),
    }
}
