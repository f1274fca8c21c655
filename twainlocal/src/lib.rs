//! # twainlocal
//!
//! TWAIN Local protocol and session engine.
//!
//! Both roles of the protocol live here:
//! - the device role: [`DeviceScanner`] owns the session state machine and a
//!   scanner driver, [`Dispatcher`] routes HTTP exchanges to it and
//!   [`server`] exposes it with axum
//! - the client role: [`Client`] issues session commands to a device and
//!   [`scan`] drives a whole capture into an images folder
//!
//! ## Quick Start
//!
//! ```no_run
//! use twainlocal::{Client, ScanOptions, scan};
//! use twainlocal_transport::HttpTransport;
//!
//! #[tokio::main]
//! async fn main() -> twainlocal::Result<()> {
//!     let client = Client::new(HttpTransport::new("http://192.168.1.20:55555")?);
//!
//!     client.create_session().await?;
//!     let summary = scan(&client, &ScanOptions::new("images")).await?;
//!     println!("{} images", summary.images.len());
//!     client.close_session().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod carrier;
pub mod client;
pub mod config;
pub mod device;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod scan;
pub mod server;

// Re-exports
pub use carrier::{CommandCarrier, Reply};
pub use client::Client;
pub use config::{Config, Timeouts};
pub use device::DeviceScanner;
pub use dispatcher::{Dispatcher, InboundRequest};
pub use driver::{IpcDriver, ScannerDriver};
pub use error::{Error, Result};
pub use scan::{ScanOptions, ScanSummary, scan};

// Re-export types
pub use twainlocal_core::{ErrorCode, Method, Session, SessionEvent, SessionState};
pub use twainlocal_types::DeviceRegister;
