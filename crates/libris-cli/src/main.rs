//! Libris CLI - drive the session and favorites core from a terminal.
//!
//! Logs in against the configured backend, keeps the credential between
//! runs and lets you inspect or toggle favorites.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use libris_core::api::ApiRequest;
use libris_core::{App, Config, LoginRequest, NavigationGuard, SessionState};

/// Directory for a daily-rolling log file, in addition to stderr
const ENV_LOG_DIR: &str = "LIBRIS_LOG_DIR";

#[derive(Parser)]
#[command(name = "libris", version, about = "Library backend session client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in and keep the credential for later runs
    Login {
        /// Defaults to the last username used
        username: Option<String>,
    },
    /// End the session here and on the server
    Logout,
    /// Show whether a session is held and when it expires
    Status,
    /// List favorites as the server reports them
    Favorites,
    /// Flip favorite membership of an item
    Toggle { id: String },
    /// GET a path with the session credential and print the body
    Get { path: String },
}

/// Initialize the tracing subscriber for logging
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(ENV_LOG_DIR) {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "libris.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

/// Sends the user back to `libris login` when the session dies under them.
struct LoginPrompt;

impl NavigationGuard for LoginPrompt {
    fn on_session_expired(&self) {
        eprintln!("Session expired. Run `libris login` to sign in again.");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _log_guard = init_tracing();

    let config = Config::load()?;
    info!(base_url = %config.base_url, "Libris starting");
    let mut app = App::new(config, Some(Arc::new(LoginPrompt)))?;

    match cli.command {
        Command::Login { username } => login(&mut app, username).await,
        Command::Logout => {
            app.session.logout().await;
            println!("Logged out");
            Ok(())
        }
        Command::Status => {
            status(&app);
            Ok(())
        }
        Command::Favorites => {
            let entries = app.favorites.refresh().await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
            Ok(())
        }
        Command::Toggle { id } => {
            // Seed local state so the toggle flips the server's view, not an empty one.
            app.favorites.refresh().await?;
            let now = app.favorites.toggle(id.as_str()).await?;
            println!("{} {}", id, if now { "is now a favorite" } else { "is no longer a favorite" });
            Ok(())
        }
        Command::Get { path } => {
            let response = app.client.send(ApiRequest::get(path)).await?;
            println!("{}", response.body);
            Ok(())
        }
    }
}

async fn login(app: &mut App, username: Option<String>) -> Result<()> {
    let username = match username.or_else(|| app.config.last_username.clone()) {
        Some(name) => name,
        None => prompt("Username: ")?,
    };
    let password = rpassword::prompt_password(format!("Password for {}: ", username))
        .context("Failed to read password")?;

    if let Err(e) = app.session.login(&LoginRequest::new(&username, password)).await {
        let message = app.session.login_error().unwrap_or_else(|| e.to_string());
        anyhow::bail!("Login failed: {}", message);
    }

    app.config.last_username = Some(username.clone());
    app.config.save()?;
    println!("Logged in as {}", username);
    Ok(())
}

fn status(app: &App) {
    match (app.session.state(), app.session.credential()) {
        (SessionState::LoggedIn, Some(credential)) => {
            let user = app.config.last_username.as_deref().unwrap_or("unknown user");
            if credential.is_expired() {
                println!("Logged in as {} (token expired, will refresh on next call)", user);
                return;
            }
            match credential.minutes_until_expiry() {
                Some(minutes) => {
                    println!("Logged in as {} (token expires in {} min)", user, minutes)
                }
                None => println!("Logged in as {}", user),
            }
        }
        _ => println!("Logged out"),
    }
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let value = line.trim().to_string();
    if value.is_empty() {
        anyhow::bail!("Username is required");
    }
    Ok(value)
}
