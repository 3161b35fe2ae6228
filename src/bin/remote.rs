//! Remote half binary
//!
//! Usage: splitproxy-remote [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file (TOML)
//!   -g, --generate       Generate a configuration with a random key
//!   -h, --help           Print help information

use std::env;

use splitproxy::server::{RemoteConfigFile, RemoteServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Respects RUST_LOG (e.g. RUST_LOG=debug)
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
        "-g" | "--generate" => {
            generate_config()?;
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_remote(&args[2]).await?;
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
        r#"splitproxy-remote - tunnel endpoint for splitproxy-local

USAGE:
    splitproxy-remote [OPTIONS]

OPTIONS:
    -c, --config <FILE>     Path to configuration file
    -g, --generate          Generate a new configuration
    -h, --help              Print help information

EXAMPLES:
    Generate a new configuration:
        splitproxy-remote --generate > remote.toml

    Run the endpoint:
        splitproxy-remote --config remote.toml
"#
    );
}

fn generate_config() -> anyhow::Result<()> {
    let passphrase = splitproxy::crypto::generate_passphrase();
    let config_file = RemoteConfigFile {
        listen_host: "0.0.0.0".to_string(),
        listen_port: 12345,
        key: passphrase.clone(),
        verify_key: true,
        timeout_secs: splitproxy::DEFAULT_IDLE_TIMEOUT_SECS,
        connect_timeout_secs: 10,
    };

    println!("# splitproxy remote configuration");
    println!("# Generated: {}", chrono::Utc::now());
    println!();
    println!("{}", toml::to_string_pretty(&config_file)?);
    println!();
    println!("# Put the same key in local.json:");
    println!("#   \"key\": \"{}\"", passphrase);

    Ok(())
}

async fn run_remote(config_path: &str) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(config_path)?;
    let config = RemoteConfigFile::from_toml(&content)?.to_config()?;

    tracing::info!(
        "Key verification: {}",
        if config.verify_key { "enforced" } else { "off" }
    );
    tracing::info!("Idle timeout: {}s", config.idle_timeout.as_secs());

    let server = RemoteServer::new(config);
    server.run().await?;

    Ok(())
}
