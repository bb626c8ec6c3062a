// # Backend Database Layer
//
// Everything between the proxy and the real database: the driver seam
// (trait objects, so no compile-time dependency on any concrete database),
// the backend session wrapper that pools hand out, the resizable session
// pool itself, and the pluggable pool-provider SPI.

pub mod driver;
pub mod memory;
pub mod pool;
pub mod provider;
pub mod session;

pub use driver::{DatabaseDriver, DbConnection, XaConnection};
pub use pool::{BackendPool, PoolStatistics};
pub use provider::{DriverRegistry, PoolProvider, ProviderRegistry, XaPoolProvider};
pub use session::{BackendSession, SessionFactory};
