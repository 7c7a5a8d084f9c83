//! # SPI Client Library
//!
//! POS-side engine for the Simple Payments Integration protocol. A point of
//! sale pairs with an EFTPOS terminal once, then drives purchases, refunds,
//! cashouts, settlement, preauths and pay-at-table over an encrypted
//! WebSocket.
//!
//! ## Overview
//!
//! - **Engine**: [`Spi`] owns the connection and all flow state, and reports
//!   progress as [`SpiEvent`]s on a broadcast channel
//! - **Pairing**: key negotiation plus a confirmation code checked on both
//!   sides (see [`pairing`])
//! - **Transactions**: one at a time, with signature, phone authorisation,
//!   cancel and recovery (see [`transaction`])
//! - **Keepalive**: pings that detect a dead terminal (see [`keepalive`])
//! - **Transport**: any [`Connection`]; [`WebSocketConnection`] in production
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                        Spi                           │
//! │  ┌──────────┐  ┌─────────────┐  ┌─────────────────┐  │
//! │  │ pairing  │  │ transaction │  │  pay at table   │  │
//! │  └──────────┘  └─────────────┘  └─────────────────┘  │
//! │  ┌──────────┐  ┌─────────────┐                       │
//! │  │keepalive │  │   monitor   │                       │
//! │  └──────────┘  └─────────────┘                       │
//! ├──────────────────────────────────────────────────────┤
//! │              Connection (WebSocket)                  │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use spi_client::{Config, Spi, SpiEvent};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = Config::load_default()?;
//! spi_client::logging::init_tracing(&config.logging.log_level)?;
//!
//! let spi = Spi::from_config(&config, None);
//! let mut events = spi.subscribe();
//! spi.start();
//! spi.pair();
//!
//! while let Ok(event) = events.recv().await {
//!     if let SpiEvent::PairingFlowStateChanged(pairing) = event {
//!         println!("{}", pairing.message);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod keepalive;
pub mod logging;
pub mod monitor;
pub mod pairing;
pub mod pay_at_table;
pub mod preauth;
pub mod spi;
pub mod transaction;

pub use config::{Config, ConfigError};
pub use connection::{Connection, ConnectionEvent, ConnectionState, WebSocketConnection};
pub use pairing::PairingFlowState;
pub use pay_at_table::PayAtTableHandler;
pub use spi::{Spi, SpiEvent, SpiFlow, SpiStatus};
pub use transaction::{
    InitiateTxResult, MidTxResult, SubmitAuthCodeResult, TransactionFlowState, TransactionType,
};

pub use spi_protocol;
