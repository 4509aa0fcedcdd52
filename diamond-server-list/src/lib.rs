//! Per-unit server discovery.
//!
//! Keeps a warm, round-robin host list per deployment unit, refreshing it
//! in the background and falling back to a local snapshot when discovery
//! is unreachable.

mod manager;
mod pool;
mod transport;

pub use manager::{EventSink, ServerListError, ServerListEvent, ServerListManager, CURRENT_UNIT};
pub use pool::ServerPool;
pub use transport::{parse_host_list, DiscoveryResponse, DiscoveryTransport};
