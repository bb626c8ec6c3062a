// # Client Router
//
// The client half of the proxy: per-server channels, endpoint health, the
// session-to-server binding registry, affinity routing, and the logical
// connection surface applications use.

pub mod channel;
pub mod facade;
pub mod manager;
pub mod tracker;

pub use channel::RpcChannel;
pub use facade::{LogicalConnection, ProxyDataSource, XaLogicalConnection};
pub use manager::MultinodeConnectionManager;
pub use tracker::SessionTracker;
