use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use samlvpn::config::{self, Config};
use samlvpn::{Connection, Outcome, SamlVpn, SessionContext};

#[derive(Parser)]
#[command(name = "samlvpn")]
#[command(about = "Connect to SAML-authenticated OpenVPN endpoints")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: first of the standard locations that exists)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Authenticate and connect
    Connect {
        /// Print the OpenVPN command instead of running it
        ///
        /// The credentials file is left in place for the printed command.
        #[arg(long)]
        print_only: bool,

        /// Reconnect this many times after AUTH_FAILED
        #[arg(long)]
        retries: Option<u32>,
    },
    /// Generate default config file
    Init {
        /// Where to write it (default: first standard location)
        path: Option<PathBuf>,
    },
    /// Validate the config and OpenVPN profile
    Check,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries OpenVPN's output and printed commands
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32, Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Connect {
            print_only,
            retries,
        } => {
            let (path, mut config) = Config::find(cli.config.as_deref())?;
            info!("Using config {}", path.display());
            if print_only {
                config.run_command = false;
            }
            if let Some(retries) = retries {
                config.auth_failed_retries = retries;
            }

            let vpn = SamlVpn::new(config)?;

            let connection = match vpn.connect().await {
                Ok(connection) => connection,
                Err(samlvpn::Error::Interrupted) => {
                    warn!("Interrupted");
                    return Ok(130);
                }
                Err(e) => return Err(e.into()),
            };

            match connection {
                Connection::Printed(command) => {
                    println!("{}", command);
                }
                Connection::Finished(Outcome::ConnectionLost) => {
                    warn!("VPN connection lost");
                }
                Connection::Finished(outcome) => {
                    info!("VPN session ended: {}", outcome);
                }
            }
            Ok(0)
        }
        Commands::Init { path } => {
            let path = match path.or(cli.config) {
                Some(path) => path,
                None => config::default_search_paths()
                    .into_iter()
                    .next()
                    .ok_or("No default config location; pass a path")?,
            };
            if path.exists() {
                error!("{} already exists, not overwriting", path.display());
                return Ok(1);
            }

            let config = Config {
                openvpn_config_file: PathBuf::from("~/.config/samlvpn/client.ovpn"),
                ..Config::default()
            };
            config.save(&path)?;
            println!("Created default config: {}", path.display());
            println!("Set openvpn_config_file to your OpenVPN profile before connecting.");
            Ok(0)
        }
        Commands::Check => {
            let (path, config) = Config::find(cli.config.as_deref())?;
            config.validate()?;
            let context = SessionContext::load(&config)?;

            println!("Config: {}", path.display());
            println!("  Endpoint: {}:{} ({})", context.host, context.port, context.protocol);
            println!("  OpenVPN: {}", context.binary.display());
            println!("  Profile: {}", context.config_path.display());
            println!("  Callback: http://{}", config.server_address);
            println!(
                "  Credentials: {}",
                config.temp_credentials_file_path.display()
            );
            Ok(0)
        }
    }
}
