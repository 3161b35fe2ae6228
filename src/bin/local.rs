//! Local half binary
//!
//! Usage: splitproxy-local [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file (JSON)
//!   --check <FILE>       Validate a configuration file and exit
//!   -h, --help           Print help information

use std::env;
use std::sync::Arc;

use splitproxy::server::{open_policy_store, LocalConfig, LocalConfigFile, LocalServer, ServerState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG (e.g. RUST_LOG=splitproxy=trace for payload dumps)
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "--check" => {
            if args.len() < 3 {
                eprintln!("Error: --check requires a config file path");
                return Ok(());
            }
            check_config(&args[2])?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_local(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"splitproxy-local - SOCKS5/HTTP proxy that tunnels to splitproxy-remote

USAGE:
    splitproxy-local [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to configuration file
    --check <FILE>       Validate configuration and print a summary
    -h, --help           Print help information

CONFIGURATION FILE FORMAT (JSON):
    {{
        "listen_host": "127.0.0.1",
        "listen_port": 1080,
        "host": "remote.example.net",
        "port": 12345,
        "key": "<passphrase>",
        "with_direct": false,
        "direct_host": "10.0.0.2",
        "direct_port": 12345,
        "direct_key": "<passphrase>",
        "domain_list": ["\\.cn$"],
        "with_black_list": false,
        "black_list": ["^ads\\."],
        "white_list": [],
        "redis_url": "redis://127.0.0.1:6379/7",
        "timeout_secs": 3600
    }}

EXAMPLES:
    Run the proxy:
        splitproxy-local --config local.json
"#
    );
}

fn load_config(path: &str) -> anyhow::Result<LocalConfig> {
    let content = std::fs::read_to_string(path)?;
    let config = LocalConfigFile::from_json(&content)?.to_config()?;
    Ok(config)
}

fn check_config(path: &str) -> anyhow::Result<()> {
    let config = load_config(path)?;

    println!("Listen:    {}", config.listen_addr());
    println!("Upstream:  {}", config.primary.addr());
    match (&config.direct, config.with_direct) {
        (Some(direct), true) => println!(
            "Direct:    {} ({} domain patterns)",
            direct.addr(),
            config.domain_patterns.len()
        ),
        _ => println!("Direct:    disabled"),
    }
    println!(
        "Blacklist: {}",
        if config.with_black_list { "enabled" } else { "disabled" }
    );
    println!("Timeout:   {}s", config.idle_timeout.as_secs());

    Ok(())
}

async fn run_local(path: &str) -> anyhow::Result<()> {
    let config = load_config(path)?;

    tracing::info!("Upstream: {}", config.primary.addr());
    if let (Some(direct), true) = (&config.direct, config.with_direct) {
        tracing::info!("Direct upstream: {}", direct.addr());
    }

    let store = open_policy_store(&config).await?;
    let state = Arc::new(ServerState::new(config, store));
    let server = LocalServer::new(state);
    server.run().await?;

    Ok(())
}
