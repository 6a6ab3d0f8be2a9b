// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Loophole Contributors

// Loophole - CLI
// Exposes a local port or directory under a public HTTPS URL

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use loophole_common::protocol::{TUNNEL_STARTED, TUNNEL_STOPPED};
use loophole_common::{
    BasicAuthCredentials, ClientConfig, DaemonClient, DaemonCommand, LocalDirectorySpecs,
    LocalHttpEndpointSpecs, LocalTarget, TunnelEvent, Uuid, DEFAULT_LOCAL_HOST,
};
use loophole_daemon::{
    build_engine, shutdown_signal, Daemon, TunnelHandle, TunnelRequest, EVENT_CHANNEL_CAPACITY,
};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "loophole")]
#[command(about = "Expose local HTTP services and directories under public HTTPS URLs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Expose a local HTTP(S) service
    Http {
        /// Local port to forward to
        port: u16,

        /// Local host to forward to
        #[arg(long, default_value = DEFAULT_LOCAL_HOST)]
        host: String,

        /// Requested site ID (the first label of the public hostname)
        #[arg(long)]
        hostname: Option<String>,

        /// The local service speaks HTTPS
        #[arg(long)]
        https: bool,

        /// Backend path to expose, prepended to every request path
        #[arg(long, default_value = "")]
        path: String,

        #[command(flatten)]
        options: SharedOptions,
    },

    /// Serve a local directory
    Dir {
        /// Directory to serve
        path: PathBuf,

        /// Requested site ID
        #[arg(long)]
        hostname: Option<String>,

        #[command(flatten)]
        options: SharedOptions,
    },

    /// Serve a local directory over WebDAV
    Webdav {
        /// Directory to serve
        path: PathBuf,

        /// Requested site ID
        #[arg(long)]
        hostname: Option<String>,

        #[command(flatten)]
        options: SharedOptions,
    },

    /// Run or control the background daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonCommands,
    },
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Run the daemon in the foreground
    Run {
        #[command(flatten)]
        options: SharedOptions,
    },

    /// Start an HTTP tunnel in the daemon
    Http {
        /// Local port to forward to
        port: u16,

        /// Local host to forward to
        #[arg(long, default_value = DEFAULT_LOCAL_HOST)]
        host: String,

        /// Requested site ID
        #[arg(long)]
        hostname: Option<String>,
    },

    /// List tunnels running in the daemon
    Ps,

    /// Stop a tunnel running in the daemon
    Stop {
        /// Tunnel ID as shown by `loophole daemon ps`
        tunnel_id: Uuid,
    },
}

#[derive(Args, Debug, Default)]
struct SharedOptions {
    /// Username for HTTP basic auth on the public URL
    #[arg(long, requires = "basic_auth_password")]
    basic_auth_username: Option<String>,

    /// Password for HTTP basic auth on the public URL
    #[arg(long, requires = "basic_auth_username")]
    basic_auth_password: Option<String>,

    /// Use a local control plane and gateway with self-signed certificates
    #[arg(long)]
    dev: bool,

    /// Only accept TLS 1.3 on the local server
    #[arg(long)]
    disable_old_ciphers: bool,

    /// Answer 502 without the HTML page when the local service is down
    #[arg(long)]
    disable_proxy_error_page: bool,

    /// Do not list directory contents
    #[arg(long)]
    disable_directory_listing: bool,
}

impl SharedOptions {
    /// Configuration file settings with command-line overrides applied
    fn config(&self) -> Result<ClientConfig> {
        let mut config = if self.dev {
            let stored = ClientConfig::load().context("Failed to load configuration")?;
            ClientConfig {
                identity_file: stored.identity_file,
                token_file: stored.token_file,
                ..ClientConfig::development()
            }
        } else {
            ClientConfig::load().context("Failed to load configuration")?
        };

        config.disable_old_ciphers |= self.disable_old_ciphers;
        config.disable_proxy_error_page |= self.disable_proxy_error_page;
        config.disable_directory_listing |= self.disable_directory_listing;
        config.validate()?;
        Ok(config)
    }

    fn basic_auth(&self) -> Option<BasicAuthCredentials> {
        BasicAuthCredentials::from_parts(
            self.basic_auth_username.clone(),
            self.basic_auth_password.clone(),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loophole=info,loophole_daemon=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Http {
            port,
            host,
            hostname,
            https,
            path,
            options,
        } => {
            let target = LocalTarget::Http(LocalHttpEndpointSpecs {
                host,
                port,
                use_tls: https,
                path,
            });
            run_foreground(target, hostname, &options).await
        }
        Commands::Dir {
            path,
            hostname,
            options,
        } => {
            let target = LocalTarget::Directory(LocalDirectorySpecs { path });
            run_foreground(target, hostname, &options).await
        }
        Commands::Webdav {
            path,
            hostname,
            options,
        } => {
            let target = LocalTarget::WebDav(LocalDirectorySpecs { path });
            run_foreground(target, hostname, &options).await
        }
        Commands::Daemon { action } => match action {
            DaemonCommands::Run { options } => run_daemon(&options).await,
            DaemonCommands::Http {
                port,
                host,
                hostname,
            } => {
                daemon_request(
                    DaemonCommand::Http {
                        port,
                        local_host: host,
                        site_id: hostname,
                    },
                    Some(TUNNEL_STARTED),
                )
                .await
            }
            DaemonCommands::Ps => daemon_request(DaemonCommand::Ps, None).await,
            DaemonCommands::Stop { tunnel_id } => {
                daemon_request(DaemonCommand::Stop { tunnel_id }, Some(TUNNEL_STOPPED)).await
            }
        },
    }
}

/// Run one tunnel until Ctrl+C or a terminal failure
async fn run_foreground(
    target: LocalTarget,
    hostname: Option<String>,
    options: &SharedOptions,
) -> Result<()> {
    let config = options.config()?;
    let (events, event_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let engine = build_engine(&config, events).await?;

    println!("{}", format!("Exposing {}", target).bold());

    let spinner = spinner();
    let render = tokio::spawn(render_events(event_rx, spinner.clone()));

    let request = TunnelRequest::new(target)
        .with_site_id(hostname)
        .with_basic_auth(options.basic_auth());

    let handle = tokio::select! {
        result = engine.start(request) => match result {
            Ok(handle) => handle,
            Err(e) => {
                spinner.finish_and_clear();
                render.abort();
                return Err(e).context("Failed to start tunnel");
            }
        },
        _ = tokio::signal::ctrl_c() => {
            spinner.finish_and_clear();
            render.abort();
            println!("{}", "Interrupted".yellow());
            return Ok(());
        }
    };

    let result = wait_or_interrupt(handle).await;
    // Let the renderer drain the final events
    tokio::time::sleep(Duration::from_millis(50)).await;
    render.abort();

    result.context("Tunnel failed")?;
    println!("{}", "✓ Tunnel stopped".green().bold());
    Ok(())
}

async fn wait_or_interrupt(handle: TunnelHandle) -> Result<(), loophole_common::TunnelError> {
    let cancel = handle.cancellation();
    let finished = handle.wait();
    tokio::pin!(finished);

    tokio::select! {
        result = &mut finished => result,
        _ = tokio::signal::ctrl_c() => {
            println!();
            println!("{}", "Stopping tunnel...".yellow());
            cancel.cancel();
            finished.await
        }
    }
}

fn spinner() -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .template("{spinner:.cyan} {msg}")
        .map(|style| style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "✓"]))
    {
        spinner.set_style(style);
    }
    spinner.set_message("Registering site...");
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Drive the spinner while starting, then print status changes
async fn render_events(mut events: broadcast::Receiver<TunnelEvent>, spinner: ProgressBar) {
    let mut announced = false;
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Skipped {} tunnel events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            TunnelEvent::Registering { .. } => spinner.set_message("Registering site..."),
            TunnelEvent::Registered { site_id, .. } => {
                spinner.set_message(format!("Site {} registered, starting local server...", site_id))
            }
            TunnelEvent::ServerStarted { .. } => {
                spinner.set_message("Connecting to the gateway...")
            }
            TunnelEvent::Connecting { attempt, .. } if attempt > 1 => {
                spinner.set_message(format!("Connecting to the gateway (attempt {})...", attempt))
            }
            TunnelEvent::Connecting { .. } => {}
            TunnelEvent::Accepting { id, urls, .. } => {
                if announced {
                    println!("{}", "Reconnected".green());
                    continue;
                }
                announced = true;
                spinner.finish_and_clear();
                announce_urls(&id, &urls);
            }
            TunnelEvent::Reconnecting { .. } => {
                println!("{}", "Gateway dropped the tunnel, reconnecting...".yellow())
            }
            TunnelEvent::RelayFailed { error, .. } => eprintln!("{}", error.red()),
            TunnelEvent::Stopped { .. } => break,
            TunnelEvent::Failed { .. } => {
                spinner.finish_and_clear();
                break;
            }
        }
    }
}

fn announce_urls(id: &Uuid, urls: &[String]) {
    println!();
    println!("{}", "✓ Forwarding is ready!".green().bold());
    for url in urls {
        println!("  {}", url.cyan().bold().underline());
    }
    println!();
    println!("{}", format!("Tunnel ID: {}", id).dimmed());
    println!("{}", "Press Ctrl+C to stop".dimmed());
}

/// Run the daemon in this process
async fn run_daemon(options: &SharedOptions) -> Result<()> {
    let config = options.config()?;
    let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let engine = build_engine(&config, events).await?;

    let listener = Daemon::bind(config.daemon_port).await?;
    println!(
        "{}",
        format!("Daemon listening on 127.0.0.1:{}", config.daemon_port)
            .green()
            .bold()
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    Daemon::new(engine).serve(listener, shutdown).await
}

/// Send one command to the daemon and print its answer
///
/// With `expected` set, any other answer is an error.
async fn daemon_request(command: DaemonCommand, expected: Option<&str>) -> Result<()> {
    let config = ClientConfig::load().context("Failed to load configuration")?;
    let response = DaemonClient::new(config.daemon_port).send(&command).await?;

    match expected {
        Some(expected) if response != expected => anyhow::bail!("{}", response.trim_end()),
        Some(_) => println!("{}", response.trim_end().green()),
        None => print!("{}", response),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_http_with_flags() {
        let cli = Cli::try_parse_from([
            "loophole",
            "http",
            "3000",
            "--hostname",
            "mysite",
            "--https",
            "--path",
            "/app",
            "--basic-auth-username",
            "alice",
            "--basic-auth-password",
            "secret",
            "--disable-old-ciphers",
        ])
        .unwrap();

        match cli.command {
            Commands::Http {
                port,
                host,
                hostname,
                https,
                path,
                options,
            } => {
                assert_eq!(port, 3000);
                assert_eq!(path, "/app");
                assert_eq!(host, DEFAULT_LOCAL_HOST);
                assert_eq!(hostname.as_deref(), Some("mysite"));
                assert!(https);
                assert!(options.disable_old_ciphers);
                let auth = options.basic_auth().unwrap();
                assert_eq!(auth.username, "alice");
                assert_eq!(auth.password.as_str(), "secret");
            }
            _ => panic!("expected http command"),
        }
    }

    #[test]
    fn test_basic_auth_needs_both_parts() {
        assert!(Cli::try_parse_from([
            "loophole",
            "dir",
            ".",
            "--basic-auth-username",
            "alice",
        ])
        .is_err());
    }

    #[test]
    fn test_parse_daemon_commands() {
        let id = Uuid::new_v4();
        let cli = Cli::try_parse_from(["loophole", "daemon", "stop", &id.to_string()]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Daemon {
                action: DaemonCommands::Stop { tunnel_id }
            } if tunnel_id == id
        ));

        let cli = Cli::try_parse_from(["loophole", "daemon", "http", "8080", "--host", "::1"])
            .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Daemon {
                action: DaemonCommands::Http { port: 8080, ref host, hostname: None }
            } if host == "::1"
        ));

        assert!(Cli::try_parse_from(["loophole", "daemon", "stop", "not-a-uuid"]).is_err());
    }
}
