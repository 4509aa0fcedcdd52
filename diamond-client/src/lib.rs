//! Client for a clustered configuration service: per-unit server discovery,
//! signed requests, local snapshot fallback, and a long-polling subscription
//! engine.
//!
//! [`Facade`] is the type application code constructs and holds; it lazily
//! creates one [`UnitClient`] per deployment unit, all sharing one
//! [`diamond_server_list::ServerListManager`] and one
//! [`diamond_snapshot::Snapshot`].

mod constants;
pub mod config;
pub mod error;
mod facade;
mod sign;
pub mod transport;
mod unit_client;

pub use config::{Config, ConfigBuilder};
pub use error::{DiamondError, DiamondEvent};
pub use facade::Facade;
pub use transport::{HttpRequest, HttpResponse, Method, Transport, UreqTransport};
pub use unit_client::{ConfigItem, Listener, UnitClient};
