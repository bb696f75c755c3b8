// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! iprohc_client: establishes a tunnel with an iprohc server.
//!
//! The client opens the TCP control connection, performs the TLS
//! handshake, asks for a tunnel and then keeps the session alive until a
//! signal or the server ends it. Exit codes: 0 clean shutdown, 1
//! unrecoverable local error (including a lost session), 2 inability to
//! connect.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use iprohc::client::ClientSession;
use iprohc::event::SignalPipe;
use iprohc::net::{RawTunnelSocket, VirtualInterface};
use iprohc::session::{tls, SessionEndpoint, SessionShared};

#[derive(Parser, Debug)]
#[command(
    name = "iprohc_client",
    version,
    disable_version_flag = true,
    about = "IP/compressed-header tunnel client: establish a tunnel with a server",
    after_help = "You must be root (or hold CAP_NET_ADMIN and CAP_NET_RAW) to run the \
                  tunnel client.\n\nEstablish a tunnel with the server at 192.168.1.14 \
                  through eth0:\n  iprohc_client -r 192.168.1.14 -b eth0 -i iprohc -P ./client.p12"
)]
struct Args {
    /// The address of the remote server
    #[arg(short = 'r', long = "remote")]
    remote: String,

    /// The name of the underlying interface
    #[arg(short = 'b', long = "basedev")]
    basedev: String,

    /// The name of the interface that will be created
    #[arg(short = 'i', long = "dev")]
    dev: String,

    /// The path to the credential file (server CA, client key and
    /// certificate)
    #[arg(short = 'P', long = "p12")]
    p12: PathBuf,

    /// The port of the remote server
    #[arg(short = 'p', long = "port", default_value_t = iprohc::DEFAULT_PORT)]
    port: u16,

    /// Override the packing level sent by the server (0 = server choice)
    #[arg(short = 'k', long = "packing", default_value_t = 0)]
    packing: u8,

    /// Path to a shell script run once the tunnel is ready
    #[arg(short = 'u', long = "up")]
    up: Option<PathBuf>,

    /// Enable debugging
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Print the software version
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,
}

/// Local context built before the network is touched.
struct LocalSetup {
    signals: SignalPipe,
    tls: Arc<tls::TlsClientConfig>,
    tun: Arc<VirtualInterface>,
    raw: Arc<RawTunnelSocket>,
}

fn main() {
    let args = Args::parse();
    iprohc::logging::init("iprohc_client", args.debug);

    let local = match setup_local(&args) {
        Ok(local) => local,
        Err(e) => {
            log::error!("[CLIENT] {:#}", e);
            process::exit(1);
        }
    };

    let session = match connect(&args, local) {
        Ok(session) => session,
        Err(e) => {
            log::error!("[CLIENT] unable to connect: {:#}", e);
            process::exit(2);
        }
    };

    let exit = session.run();
    log::info!("[CLIENT] client stops with exit code {}", exit.code());
    process::exit(exit.code());
}

/// Local resources; failures here are exit code 1.
fn setup_local(args: &Args) -> anyhow::Result<LocalSetup> {
    iprohc::net::ifindex(&args.basedev)
        .with_context(|| format!("underlying interface '{}'", args.basedev))?;

    let signals = SignalPipe::install_client().context("signal setup")?;

    let creds = tls::load_credentials(&args.p12)?;
    let tls = Arc::new(tls::client_config(creds)?);

    let tun = Arc::new(
        VirtualInterface::create(&args.dev)
            .with_context(|| format!("TUN interface '{}'", args.dev))?,
    );
    let raw = Arc::new(RawTunnelSocket::create().context("raw socket")?);

    Ok(LocalSetup {
        signals,
        tls,
        tun,
        raw,
    })
}

/// Reach the server and stand the control session up; failures here are
/// exit code 2.
fn connect(args: &Args, local: LocalSetup) -> anyhow::Result<ClientSession> {
    let candidates: Vec<SocketAddr> = (args.remote.as_str(), args.port)
        .to_socket_addrs()
        .with_context(|| format!("resolve '{}'", args.remote))?
        .filter(SocketAddr::is_ipv4)
        .collect();
    if candidates.is_empty() {
        anyhow::bail!("no IPv4 address available for '{}'", args.remote);
    }

    let mut sock = None;
    for addr in &candidates {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                sock = Some(stream);
                break;
            }
            Err(e) => log::warn!("[CLIENT] connection to {} failed: {}", addr, e),
        }
    }
    let Some(sock) = sock else {
        anyhow::bail!("failed to connect to '{}' on port {}", args.remote, args.port);
    };

    // The local endpoint is what the server will see as this client's
    // underlying address; useful when debugging ingress filtering.
    log::info!(
        "[CLIENT] local address {} is used to contact server {}",
        sock.local_addr().context("local address")?,
        sock.peer_addr().context("peer address")?
    );

    let server_name = tls::ServerName::try_from(args.remote.clone())
        .with_context(|| format!("server name '{}'", args.remote))?;

    let shared = Arc::new(SessionShared::new());
    let endpoint = SessionEndpoint::client(sock, local.tls, server_name, Arc::clone(&shared))
        .context("TLS session")?;

    Ok(ClientSession {
        endpoint,
        shared,
        signals: local.signals,
        tun: local.tun,
        raw: local.raw,
        tun_name: args.dev.clone(),
        requested_packing: (args.packing != 0).then_some(args.packing),
        up_script: args.up.clone(),
    })
}
