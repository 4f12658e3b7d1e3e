//! Portal socket bridge.
//!
//! The collaborators around the channel protocol: the public frontend server
//! that accepts clients on `/ws_in` and outlets on `/ws_out`, the in-process
//! broadcast bus that links them, and the outlet client that connects back to
//! a frontend and dials the real destinations.

pub mod bus;
pub mod config;
pub mod error;
pub mod frontend;
pub mod outlet;
pub mod socket;

pub use bus::{BroadcastBus, OutletClaim};
pub use config::{FrontendConfig, OutletConfig, PortalConfig};
pub use error::{BridgeError, BridgeResult};
pub use frontend::FrontendServer;
pub use outlet::Outlet;
