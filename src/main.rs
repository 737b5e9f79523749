//! tproxy-relay daemon entry point

use std::process;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tproxy_relay::config::{self, Config, LogConfig};
use tproxy_relay::dialer::Dialer;
use tproxy_relay::proxy::ProxyServer;
use tproxy_relay::redirect;

/// Parsed command-line arguments
struct Args {
    config_path: String,
    check_only: bool,
    generate_config: bool,
}

fn print_help() {
    println!("tproxy-relay {} - transparent TCP proxy", tproxy_relay::VERSION);
    println!();
    println!("USAGE:");
    println!("    tproxy-relay [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <PATH>      Configuration file path [default: config.json]");
    println!("        --check              Validate configuration and exit");
    println!("    -g, --generate-config    Write a default configuration file and exit");
    println!("    -h, --help               Print help");
    println!("    -v, --version            Print version");
    println!();
    println!("ENVIRONMENT:");
    println!("    TPROXY_RELAY_LISTEN_ADDR             Override listen address");
    println!("    TPROXY_RELAY_LOG_LEVEL               Override log level");
    println!("    TPROXY_RELAY_CONNECT_TIMEOUT_SECS    Override outbound connect timeout");
}

fn parse_args() -> Args {
    let mut args = Args {
        config_path: "config.json".into(),
        check_only: false,
        generate_config: false,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                if let Some(path) = iter.next() {
                    args.config_path = path;
                } else {
                    eprintln!("Error: {arg} requires a path argument");
                    process::exit(2);
                }
            }
            "--check" => args.check_only = true,
            "-g" | "--generate-config" => args.generate_config = true,
            "-h" | "--help" => {
                print_help();
                process::exit(0);
            }
            "-v" | "--version" => {
                println!("tproxy-relay {}", tproxy_relay::VERSION);
                process::exit(0);
            }
            other => {
                eprintln!("Error: unknown argument: {other}");
                print_help();
                process::exit(2);
            }
        }
    }

    args
}

fn init_logging(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&log.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(log.target);

    if log.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received interrupt");
    }
}

async fn run(config: Config) -> Result<()> {
    let dialer = Dialer::new(config.connection.connect_timeout());
    let server = ProxyServer::bind(config.listen.address, dialer)
        .await
        .context("failed to bind listen address")?;

    let bound = server.local_addr().context("failed to read bound address")?;
    let stats = server.stats();
    let shutdown = server.shutdown_sender();

    // Rules are written with the actually-bound port, so an ephemeral
    // listen port works
    let mut redirector = if config.redirect.enabled {
        let mut r = redirect::new_redirector(&config.redirect.bypass_cidrs);
        redirect::install_or_rollback(r.as_mut(), bound.port(), config.redirect.mode)
            .await
            .context("failed to install redirection rules")?;
        Some(r)
    } else {
        None
    };

    let server_result = tokio::select! {
        r = server.run() => r,
        () = wait_for_shutdown_signal() => {
            info!("Shutting down");
            let _ = shutdown.send(());
            Ok(())
        }
    };

    if let Some(r) = redirector.as_mut() {
        if let Err(e) = r.remove().await {
            warn!("Failed to remove redirection rules: {}", e);
        }
    }

    let snapshot = stats.snapshot();
    info!(
        "Final stats: {} accepted, {} completed, {} resolve failures, {} dial failures, {} tunnel failures, {} cancelled, {} bytes relayed",
        snapshot.accepted,
        snapshot.completed,
        snapshot.resolve_failures,
        snapshot.dial_failures,
        snapshot.tunnel_failures,
        snapshot.cancelled,
        snapshot.bytes_relayed,
    );

    server_result.context("proxy server failed")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = parse_args();

    if args.generate_config {
        config::create_default_config(&args.config_path)
            .with_context(|| format!("failed to write {}", args.config_path))?;
        println!("Default configuration written to {}", args.config_path);
        return Ok(());
    }

    let config = match config::load_config_with_env(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            process::exit(1);
        }
    };

    if args.check_only {
        println!("Configuration OK: {}", args.config_path);
        return Ok(());
    }

    init_logging(&config.log);
    info!("tproxy-relay {} starting", tproxy_relay::VERSION);

    if let Err(e) = run(config).await {
        error!("Fatal: {:#}", e);
        process::exit(1);
    }

    Ok(())
}
