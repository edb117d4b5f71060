//! milkauth CLI
//!
//! Command-line interface for the Remember The Milk credential subsystem.
//!
//! # Usage
//!
//! ```bash
//! # Show whether a usable credential exists and where it came from
//! milkauth status
//!
//! # Authorize interactively (prints a URL to open in a browser)
//! milkauth login --perms write
//!
//! # Redeem the ticket printed by `status` after granting access
//! milkauth login --ticket <ticket>
//!
//! # Forget the credential everywhere
//! milkauth logout
//!
//! # Check that the secure secret store works
//! milkauth diagnose
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use milkauth_core::{
    AuthConfig, AuthError, AuthStatus, Authenticator, CredentialStore, FileStore, MilkauthError,
    Permission, StoreProbeResult,
};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

mod config;

const LOG_ENV: &str = "MILKAUTH_LOG";

#[derive(Parser)]
#[command(name = "milkauth")]
#[command(about = "Credential management for the Remember The Milk API")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover and verify a credential, then report the result
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Authorize this application interactively
    Login {
        /// Permission to request (read, write, delete)
        #[arg(short, long)]
        perms: Option<Permission>,

        /// Redeem a ticket issued earlier, e.g. by `status`, instead of
        /// starting a new handshake
        #[arg(short, long, conflicts_with = "perms")]
        ticket: Option<String>,
    },

    /// Remove the stored credential from every store
    Logout,

    /// Exercise the secure secret store and report each step
    Diagnose,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;

    init_logging(&config.log_level, cli.verbose);
    info!("Loaded configuration from {:?}", config.config_path);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Status { format } => status(config.auth, &format, &cancel).await,
        Commands::Login {
            ticket: Some(ticket),
            ..
        } => redeem(config.auth, &ticket, &cancel).await,
        Commands::Login { perms, ticket: None } => {
            let permission = perms.unwrap_or(config.auth.permission);
            login(config.auth, permission, &cancel).await
        }
        Commands::Logout => logout(config.auth, &cancel).await,
        Commands::Diagnose => diagnose(config.auth, &cancel).await,
    }
}

fn init_logging(default_level: &str, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn connect(auth: AuthConfig, cancel: &CancellationToken) -> Result<Authenticator> {
    Authenticator::new(auth, cancel)
        .await
        .context("Failed to set up authentication")
}

async fn status(auth: AuthConfig, format: &str, cancel: &CancellationToken) -> Result<()> {
    let authenticator = connect(auth, cancel).await?;
    let status = authenticator
        .initialize(cancel)
        .await
        .context("Credential discovery failed")?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&status)?),
        _ => print_status(&status),
    }
    Ok(())
}

fn print_status(status: &AuthStatus) {
    if status.authenticated {
        println!("Authenticated");
        if let Some(username) = &status.username {
            println!("  User: {}", username);
        }
        if let Some(permission) = status.permission {
            println!("  Permission: {}", permission);
        }
        if let Some(source) = &status.source {
            println!("  Source: {}", source);
        }
    } else {
        println!("Not authenticated");
        match (&status.authorization_url, &status.ticket) {
            (Some(url), Some(ticket)) => {
                println!("  Open this URL to grant access:");
                println!("  {}", url);
                println!("  then run `milkauth login --ticket {}`", ticket);
            }
            _ => println!("  Run `milkauth login` to authorize."),
        }
    }
}

async fn login(
    auth: AuthConfig,
    permission: Permission,
    cancel: &CancellationToken,
) -> Result<()> {
    let authenticator = connect(auth, cancel).await?;
    let grant = authenticator
        .begin_authorization(permission, cancel)
        .await
        .context("Failed to start authorization")?;

    println!("Open this URL in a browser and grant '{}' access:", grant.permission);
    println!();
    println!("  {}", grant.authorization_url);
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        println!("Press Enter once access has been granted...");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => anyhow::bail!("Authorization cancelled"),
            line = lines.next_line() => {
                line.context("Failed to read from stdin")?;
            }
        }

        match authenticator.complete_authorization(&grant.ticket, cancel).await {
            Ok(status) => {
                print_status(&status);
                return Ok(());
            }
            Err(MilkauthError::Auth(AuthError::Abandoned { .. })) => {
                println!("Access has not been granted yet.");
            }
            Err(e) => return Err(e).context("Failed to complete authorization"),
        }
    }
}

async fn redeem(auth: AuthConfig, ticket: &str, cancel: &CancellationToken) -> Result<()> {
    let authenticator = connect(auth, cancel).await?;
    match authenticator.complete_authorization(ticket, cancel).await {
        Ok(status) => {
            print_status(&status);
            Ok(())
        }
        Err(MilkauthError::Auth(AuthError::Abandoned { .. })) => anyhow::bail!(
            "Access has not been granted for ticket {} yet, or the ticket has expired",
            ticket
        ),
        Err(e) => Err(e).context("Failed to complete authorization"),
    }
}

async fn logout(auth: AuthConfig, cancel: &CancellationToken) -> Result<()> {
    let authenticator = connect(auth, cancel).await?;
    authenticator.logout().await.context("Failed to remove credential")?;
    println!("Credential removed");
    Ok(())
}

async fn diagnose(auth: AuthConfig, cancel: &CancellationToken) -> Result<()> {
    println!("Secure secret store:");
    for result in keyring_probe(&auth, cancel).await {
        print_probe(&result);
    }

    let path = auth
        .store
        .resolved_file_path()
        .context("Failed to resolve the credential file path")?;
    let file_store = FileStore::new(&path);
    println!("File store ({}):", path.display());
    let result = if file_store.is_available().await {
        StoreProbeResult::ok("available", None)
    } else {
        StoreProbeResult::failed("available", "directory cannot be created")
    };
    print_probe(&result);
    Ok(())
}

#[cfg(feature = "keyring-store")]
async fn keyring_probe(auth: &AuthConfig, cancel: &CancellationToken) -> Vec<StoreProbeResult> {
    match milkauth_core::KeyringStore::new(&auth.store.keyring_service, &auth.store.keyring_account) {
        Ok(store) => {
            store
                .with_timeout(auth.store.operation_timeout())
                .with_cancellation(cancel.child_token())
                .self_test()
                .await
        }
        Err(e) => vec![StoreProbeResult::failed("open", e)],
    }
}

#[cfg(not(feature = "keyring-store"))]
async fn keyring_probe(_auth: &AuthConfig, _cancel: &CancellationToken) -> Vec<StoreProbeResult> {
    vec![StoreProbeResult::failed("open", "built without keyring support")]
}

fn print_probe(result: &StoreProbeResult) {
    match (result.success, result.error.as_deref()) {
        (true, _) => println!("  {:<10} ok", result.operation),
        (false, Some(error)) => println!("  {:<10} FAILED: {}", result.operation, error),
        (false, None) => println!("  {:<10} FAILED", result.operation),
    }
}
