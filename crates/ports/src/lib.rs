#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # warden-ports
//!
//! Discovers network listeners bound inside a running workspace by scraping
//! the kernel socket tables, and publishes full snapshots whenever the set of
//! listening ports changes.
//!
//! ```ignore
//! use warden_ports::{ObserverConfig, PollingServedPortsObserver};
//!
//! let observer = PollingServedPortsObserver::new(ObserverConfig::default());
//! let (mut snapshots, _errors) = observer.observe("10.0.5.2", shutdown);
//! while let Some(ports) = snapshots.recv().await {
//!     println!("{} ports", ports.len());
//! }
//! ```

pub mod error;
pub mod observer;
pub mod table;

pub use error::{Error, Result};
pub use observer::{
    FsTableSource, NET_TCP, NET_TCP6, ObserverConfig, PollingServedPortsObserver, TableSource,
};
pub use table::{LISTEN_STATE, ServedPort, decode_address, parse_line, parse_table, snapshot};
