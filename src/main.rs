#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::assigning_clones,
    clippy::bool_to_int_with_if,
    clippy::cast_possible_wrap,
    clippy::doc_markdown,
    clippy::field_reassign_with_default,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::manual_let_else,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::needless_raw_string_hashes,
    clippy::redundant_closure_for_method_calls,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::unused_self,
    clippy::unnecessary_cast,
    clippy::unnecessary_lazy_evaluations,
    clippy::unnecessary_literal_bound,
    clippy::unnecessary_map_or,
    clippy::unnecessary_wraps,
    dead_code
)]

use anyhow::{bail, Context, Result};
use cdp_auth::config::Config;
use cdp_auth::registry::{ApplicationRegistry, SqliteRegistry};
use cdp_auth::{daemon, token};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "cdp-auth")]
#[command(version)]
#[command(about = "Issue signed tokens to realtime clients that prove themselves with a CodePen comment.", long_about = None)]
struct Cli {
    /// Path to config.toml (default: ~/.cdp-auth/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run gateway, correlation engine and session refresher (default)
    #[command(long_about = "\
Run gateway, correlation engine and session refresher until Ctrl+C.

Requires CDP_USER, CDP_SESSION_COOKIE and PEN_ID (or the [source] config section).

Examples:
  cdp-auth serve
  cdp-auth serve --port 8080
  CDP_AUTH_MODE=global-secret JWT_SECRET=... cdp-auth serve")]
    Serve {
        /// Override gateway.host
        #[arg(long)]
        host: Option<String>,
        /// Override gateway.port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Register an application in the local registry and print its credentials
    CreateApp {
        /// Address recorded with the registration
        #[arg(long, default_value = "127.0.0.1")]
        ip: String,
    },

    /// Print a registered application's stored record
    ShowApp {
        /// Application key returned by create-app or /createApp
        api_key: String,
    },

    /// Verify a token offline and print its claims
    Verify {
        /// Signed token
        token: String,
        /// Application secret (defaults to the global secret)
        #[arg(long)]
        secret: Option<String>,
    },

    /// Print the JSON schema of the config file
    ConfigSchema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Serve {
        host: None,
        port: None,
    });

    let config_path = cli.config.as_deref();

    match command {
        Commands::Serve { host, port } => {
            let mut config = load_config(config_path).await?;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            info!(
                "Starting cdp-auth on {}:{}",
                config.gateway.host, config.gateway.port
            );
            daemon::run(config).await
        }

        Commands::CreateApp { ip } => {
            let config = load_config(config_path).await?;
            let registry = SqliteRegistry::open(&config.registry_db_path())?;
            let credentials = registry.create(&ip).await?;
            println!("{}", serde_json::to_string_pretty(&credentials)?);
            Ok(())
        }

        Commands::ShowApp { api_key } => {
            let config = load_config(config_path).await?;
            let registry = SqliteRegistry::open(&config.registry_db_path())?;
            let app = registry
                .get(api_key.trim())
                .await?
                .with_context(|| format!("No application registered with key {api_key}"))?;
            println!("{}", serde_json::to_string_pretty(&app)?);
            Ok(())
        }

        Commands::Verify { token: signed, secret } => {
            let config = load_config(config_path).await?;
            let secret = secret
                .or(config.issuance.global_secret)
                .context("--secret is required unless a global secret is configured")?;
            match token::verify(&signed, &secret) {
                Ok(claims) => {
                    println!("{}", serde_json::to_string_pretty(&claims)?);
                    Ok(())
                }
                Err(e) => bail!("Token rejected ({}): {e}", e.kind()),
            }
        }

        // Stdout-only: no config load, no logging.
        Commands::ConfigSchema => {
            println!("{}", Config::json_schema()?);
            Ok(())
        }
    }
}

/// Install the log subscriber, then read the config file.
async fn load_config(path: Option<&Path>) -> Result<Config> {
    init_logging();
    Config::load(path).await
}

/// Respects RUST_LOG, defaults to INFO
fn init_logging() {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_has_no_flag_conflicts() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["cdp-auth"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn serve_accepts_host_and_port_overrides() {
        let cli = Cli::try_parse_from(["cdp-auth", "serve", "--host", "0.0.0.0", "-p", "8080"])
            .unwrap();
        match cli.command {
            Some(Commands::Serve { host, port }) => {
                assert_eq!(host.as_deref(), Some("0.0.0.0"));
                assert_eq!(port, Some(8080));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn verify_takes_token_and_optional_secret() {
        let cli = Cli::try_parse_from(["cdp-auth", "verify", "a.b.c", "--secret", "s"]).unwrap();
        match cli.command {
            Some(Commands::Verify { token, secret }) => {
                assert_eq!(token, "a.b.c");
                assert_eq!(secret.as_deref(), Some("s"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn show_app_takes_api_key() {
        let cli = Cli::try_parse_from(["cdp-auth", "show-app", "abc123"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::ShowApp { api_key }) if api_key == "abc123"));
        assert!(Cli::try_parse_from(["cdp-auth", "show-app"]).is_err());
    }

    #[test]
    fn config_flag_is_global() {
        let cli =
            Cli::try_parse_from(["cdp-auth", "create-app", "--config", "/tmp/c.toml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
        assert!(matches!(cli.command, Some(Commands::CreateApp { ip }) if ip == "127.0.0.1"));
    }
}
