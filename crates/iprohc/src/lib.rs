// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Point-to-multipoint IP tunnel with negotiated header compression.
//!
//! A central server hands each authenticated client a tunnel address out
//! of a configured subnet and relays IPv4 traffic between its virtual
//! interface and a shared raw socket, compressing inner packets with a
//! profile negotiated over a mutually-authenticated TLS control channel.
//!
//! # Architecture
//!
//! ```text
//!             TLS/TCP control              raw IPPROTO_IPIP data
//!  client <=====================> server <=======================> clients
//!
//!  server:  supervisor -- session endpoints (control state machine)
//!           router (TUN + RAW demux threads)
//!           one tunnel worker per connected client
//!  client:  main loop -- session endpoint
//!           device pumps + one tunnel worker
//! ```
//!
//! The library carries the whole core; `iprohc_server` and
//! `iprohc_client` are thin binaries wiring it to the CLI.

pub mod client;
pub mod config;
pub mod event;
pub mod logging;
pub mod net;
pub mod pool;
pub mod protocol;
pub mod router;
pub mod session;
pub mod supervisor;
pub mod tunnel;

pub use client::{ClientExit, ClientSession};
pub use config::{ConfigError, ServerConfig, DEFAULT_CONF_PATH, DEFAULT_PORT};
pub use pool::AddrPool;
pub use protocol::{Frame, FrameError};
pub use router::{Router, RouteOutcome, SessionTable, SlotPorts};
pub use session::{SessionEndpoint, SessionError, SessionShared, SessionStatus};
pub use supervisor::{Supervisor, SupervisorConfig};
pub use tunnel::{CompatVersion, StatsSnapshot, TunnelParams, TunnelWorker};
