// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! iprohc_server: terminates tunnels requested by iprohc clients.
//!
//! Boot order follows the daemon's historical shape: signals, config,
//! credentials, listener, devices, router threads, then the supervisor
//! loop until SIGTERM/SIGINT. Exit codes: 0 clean shutdown, 2
//! configuration error, 1 runtime error.

use std::fs;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use socket2::{Domain, Protocol, Socket, Type};

use iprohc::event::SignalPipe;
use iprohc::net::{RawTunnelSocket, VirtualInterface};
use iprohc::router::{Router, SessionTable};
use iprohc::session::tls;
use iprohc::supervisor::{Supervisor, SupervisorConfig};
use iprohc::{AddrPool, ServerConfig};

/// Name the server's TUN interface is created under.
const TUN_NAME: &str = "tun_ipip";

#[derive(Parser, Debug)]
#[command(
    name = "iprohc_server",
    version,
    disable_version_flag = true,
    about = "IP/compressed-header tunnel server: establish tunnels requested by clients",
    after_help = "Start the server with the default configuration file, using network \
                  interface eth0 as the underlying link:\n  iprohc_server -b eth0"
)]
struct Args {
    /// Name of the underlying interface
    #[arg(short = 'b', long = "basedev")]
    basedev: String,

    /// Path to configuration file
    #[arg(short = 'c', long = "conf", default_value = iprohc::DEFAULT_CONF_PATH)]
    conf: PathBuf,

    /// Enable debugging
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Print the software version
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,
}

fn main() {
    let args = Args::parse();
    iprohc::logging::init("iprohc_server", args.debug);

    let config = match boot(&args) {
        Ok(config) => config,
        Err(e) => {
            log::error!("[SERVER] configuration error: {:#}", e);
            process::exit(2);
        }
    };

    match serve(&args, &config) {
        Ok(()) => {
            log::info!("[SERVER] server stops with exit code 0");
            process::exit(0);
        }
        Err(e) => {
            log::error!("[SERVER] runtime error: {:#}", e);
            remove_pidfile(&config);
            log::warn!("[SERVER] server stops with exit code 1");
            process::exit(1);
        }
    }
}

/// Configuration phase: anything wrong here is exit code 2.
fn boot(args: &Args) -> anyhow::Result<ServerConfig> {
    iprohc::net::ifindex(&args.basedev)
        .with_context(|| format!("underlying interface '{}'", args.basedev))?;

    let config = ServerConfig::from_file(&args.conf)
        .with_context(|| format!("configuration file '{}'", args.conf.display()))?;

    if config.pkcs12_file.is_none() {
        anyhow::bail!("credential file required (set pkcs12_file in the configuration)");
    }

    let pool = AddrPool::new(config.local_address, config.prefix)?;
    let width = pool.width();
    if config.max_clients > width {
        anyhow::bail!(
            "not enough IP addresses for {} clients: only {} available in {}/{}",
            config.max_clients,
            width,
            config.local_address,
            config.prefix
        );
    }
    log::info!(
        "[SERVER] {} IP addresses available for {} clients in {}/{}",
        width,
        config.max_clients,
        config.local_address,
        config.prefix
    );

    config.dump();
    Ok(config)
}

/// Everything after configuration: failures here are exit code 1.
fn serve(args: &Args, config: &ServerConfig) -> anyhow::Result<()> {
    let signals = SignalPipe::install_server().context("signal setup")?;

    let Some(creds_path) = config.pkcs12_file.as_deref() else {
        anyhow::bail!("credential file required");
    };
    log::info!(
        "[SERVER] load server certificate from file '{}'",
        creds_path.display()
    );
    let creds = tls::load_credentials(creds_path)?;
    let tls_config = Arc::new(tls::server_config(creds)?);

    log::info!("[SERVER] listen on TCP 0.0.0.0:{}", config.port);
    let listener = make_listener(config.port).context("TCP listener")?;

    log::info!("[SERVER] create TUN interface");
    let tun = Arc::new(
        VirtualInterface::create(TUN_NAME)
            .with_context(|| format!("TUN interface '{TUN_NAME}'"))?,
    );
    log::info!("[SERVER] create RAW socket");
    let raw = Arc::new(RawTunnelSocket::create().context("raw socket")?);

    let pool = AddrPool::new(config.local_address, config.prefix)?;
    pool.reserve_addr(config.local_address)
        .context("reserve server tunnel address")?;

    let table = Arc::new(SessionTable::new(config.max_clients));
    let router = Router::start(Arc::clone(&table), Arc::clone(&tun), Arc::clone(&raw))
        .context("routing threads")?;

    write_pidfile(config)?;

    let mut supervisor = Supervisor::new(SupervisorConfig {
        listener,
        signals,
        tls: tls_config,
        pool,
        table,
        tun,
        raw,
        defaults: config.params,
    })
    .context("supervisor setup")?;

    // From here on syslog is the only log sink.
    iprohc::logging::set_stderr_enabled(false);

    let result = supervisor.run().context("supervisor loop");

    router.stop();
    remove_pidfile(config);
    result
}

/// Listening socket with address re-use, built the explicit way so the
/// option is set before bind.
fn make_listener(port: u16) -> anyhow::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    let addr: std::net::SocketAddr = format!("0.0.0.0:{port}").parse()?;
    socket.bind(&addr.into())?;
    socket.listen(10)?;
    Ok(socket.into())
}

fn write_pidfile(config: &ServerConfig) -> anyhow::Result<()> {
    match &config.pidfile {
        Some(path) => {
            fs::write(path, format!("{}\n", process::id()))
                .with_context(|| format!("pidfile '{}'", path.display()))?;
        }
        None => log::warn!("[SERVER] no pidfile specified"),
    }
    Ok(())
}

fn remove_pidfile(config: &ServerConfig) {
    if let Some(path) = &config.pidfile {
        match fs::remove_file(path) {
            Ok(()) => log::info!("[SERVER] removed pidfile '{}'", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("[SERVER] failed to remove pidfile: {}", e),
        }
    }
}
