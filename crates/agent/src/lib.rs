//! # Node Agent Library
//!
//! Remote execution agent serving authenticated WebSocket channels.
//!
//! ## Overview
//!
//! The agent runs on a host and exposes one channel per operation:
//!
//! - **Command execution** (`/cmd`): run a program, stream stdout then stderr
//! - **Scripts** (`/py`, `/sh`): receive a script body, then run it
//! - **Interactive terminal** (`/tty`): bridge a program on a PTY
//! - **Upload** (`/upload`): receive a file, keeping a backup of the old one
//! - **Port probe** (`/check`): report whether a TCP port can be bound
//!
//! Each channel ends with a close frame carrying its terminal status.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  HTTP listener (plain or TLS)                                │
//! │    └─ auth gate ── WebSocket upgrade ── ChannelRequest::parse│
//! ├──────────────────────────────────────────────────────────────┤
//! │  Dispatcher                                                  │
//! │    ├─ exec::execute        ├─ session::attach_interactive    │
//! │    ├─ exec::run_script     ├─ files::upload                  │
//! │    └─ probe::probe_port                                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Session: sender half / receiver half / close(status)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agent::{AgentState, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (mut config, _) = Config::discover(None)?;
//!     let _ = config.apply_env_overrides();
//!     config.validate()?;
//!
//!     let state = AgentState::from_config(&config)?;
//!     agent::server::serve(&config, state, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading, overrides and validation
//! - [`auth`]: Access gate and HTTP Basic authentication
//! - [`server`]: Router, dispatcher and TLS listener
//! - [`session`]: Channel transport and the PTY bridge
//! - [`exec`]: Process execution engine and script channel
//! - [`files`]: Upload channel
//! - [`probe`]: Port probe channel

pub mod auth;
pub mod config;
pub mod exec;
pub mod files;
pub mod probe;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use auth::{AccessGate, BasicAuth};
pub use config::{Config, ConfigError};
pub use exec::{ProcessLauncher, SystemLauncher};
pub use server::{router, AgentState};
pub use session::{ChannelError, PayloadError, Session, SessionId};
