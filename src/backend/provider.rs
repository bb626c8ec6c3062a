// # Pool Provider SPI
//
// Pluggable pool construction. Two parallel SPIs exist, one for regular
// pools and one for XA pools; providers advertise an id, a priority, and
// availability, and the registry picks the highest-priority available
// provider. The XA SPI can additionally restrict itself to particular
// databases.
//
// The default providers work over ANY registered database driver through
// the `DatabaseDriver` trait object, so no provider links against a
// concrete database client.

use crate::config::PoolSettings;
use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use std::sync::Arc;

use super::driver::DatabaseDriver;
use super::pool::{BackendPool, PoolStatistics};
use super::session::DriverSessionFactory;

/// Connection identity a provider needs to build a pool.
#[derive(Debug, Clone)]
pub struct PoolTarget {
    pub url: String,
    pub user: String,
    pub password: String,
}

/// SPI for regular (non-XA) pools.
#[async_trait]
pub trait PoolProvider: Send + Sync {
    fn id(&self) -> &'static str;

    /// Higher wins when several providers are available.
    fn priority(&self) -> u32;

    fn is_available(&self) -> bool;

    async fn create_pool(
        &self,
        name: &str,
        target: &PoolTarget,
        settings: &PoolSettings,
        driver: Arc<dyn DatabaseDriver>,
    ) -> Result<Arc<BackendPool>>;

    async fn close_pool(&self, pool: &BackendPool) -> Result<()>;

    fn statistics(&self, pool: &BackendPool) -> PoolStatistics;
}

/// SPI for XA pools. Mirrors [`PoolProvider`] and adds database selection.
#[async_trait]
pub trait XaPoolProvider: Send + Sync {
    fn id(&self) -> &'static str;

    fn priority(&self) -> u32;

    fn is_available(&self) -> bool;

    /// Whether this provider should handle the given backend at all.
    fn supports_database(&self, url: &str, driver_name: &str) -> bool;

    async fn create_pool(
        &self,
        name: &str,
        target: &PoolTarget,
        settings: &PoolSettings,
        driver: Arc<dyn DatabaseDriver>,
    ) -> Result<Arc<BackendPool>>;

    async fn close_pool(&self, pool: &BackendPool) -> Result<()>;

    fn statistics(&self, pool: &BackendPool) -> PoolStatistics;
}

/// Built-in provider backed by the crate's own pool.
pub struct DefaultPoolProvider;

#[async_trait]
impl PoolProvider for DefaultPoolProvider {
    fn id(&self) -> &'static str {
        "default"
    }

    fn priority(&self) -> u32 {
        0
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn create_pool(
        &self,
        name: &str,
        target: &PoolTarget,
        settings: &PoolSettings,
        driver: Arc<dyn DatabaseDriver>,
    ) -> Result<Arc<BackendPool>> {
        let factory = Arc::new(DriverSessionFactory::new(
            driver,
            target.url.clone(),
            target.user.clone(),
            target.password.clone(),
            false,
            settings.validation_query.clone(),
        ));
        BackendPool::new(name, settings, factory).await
    }

    async fn close_pool(&self, pool: &BackendPool) -> Result<()> {
        pool.close().await;
        Ok(())
    }

    fn statistics(&self, pool: &BackendPool) -> PoolStatistics {
        pool.statistics()
    }
}

/// Built-in XA provider; works with any driver exposing an XA surface.
pub struct DefaultXaPoolProvider;

#[async_trait]
impl XaPoolProvider for DefaultXaPoolProvider {
    fn id(&self) -> &'static str {
        "default-xa"
    }

    fn priority(&self) -> u32 {
        0
    }

    fn is_available(&self) -> bool {
        true
    }

    fn supports_database(&self, _url: &str, _driver_name: &str) -> bool {
        true
    }

    async fn create_pool(
        &self,
        name: &str,
        target: &PoolTarget,
        settings: &PoolSettings,
        driver: Arc<dyn DatabaseDriver>,
    ) -> Result<Arc<BackendPool>> {
        let factory = Arc::new(DriverSessionFactory::new(
            driver,
            target.url.clone(),
            target.user.clone(),
            target.password.clone(),
            true,
            settings.validation_query.clone(),
        ));
        BackendPool::new(name, settings, factory).await
    }

    async fn close_pool(&self, pool: &BackendPool) -> Result<()> {
        pool.close().await;
        Ok(())
    }

    fn statistics(&self, pool: &BackendPool) -> PoolStatistics {
        pool.statistics()
    }
}

/// Registry of pool providers, consulted at pool-creation time.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn PoolProvider>>,
    xa_providers: Vec<Arc<dyn XaPoolProvider>>,
}

impl ProviderRegistry {
    /// Registry holding only the built-in providers.
    pub fn with_defaults() -> Self {
        Self {
            providers: vec![Arc::new(DefaultPoolProvider)],
            xa_providers: vec![Arc::new(DefaultXaPoolProvider)],
        }
    }

    pub fn register(&mut self, provider: Arc<dyn PoolProvider>) {
        self.providers.push(provider);
    }

    pub fn register_xa(&mut self, provider: Arc<dyn XaPoolProvider>) {
        self.xa_providers.push(provider);
    }

    /// Highest-priority available regular provider.
    pub fn select(&self) -> Result<Arc<dyn PoolProvider>> {
        self.providers
            .iter()
            .filter(|p| p.is_available())
            .max_by_key(|p| p.priority())
            .cloned()
            .ok_or_else(|| ProxyError::NoProvider("no connection pool provider available".to_string()))
    }

    /// Highest-priority available XA provider that supports the database.
    pub fn select_xa(&self, url: &str, driver_name: &str) -> Result<Arc<dyn XaPoolProvider>> {
        self.xa_providers
            .iter()
            .filter(|p| p.is_available() && p.supports_database(url, driver_name))
            .max_by_key(|p| p.priority())
            .cloned()
            .ok_or_else(|| {
                ProxyError::NoProvider(format!("no XA pool provider available for {}", url))
            })
    }
}

/// Registry of database drivers, selected by URL.
pub struct DriverRegistry {
    drivers: Vec<Arc<dyn DatabaseDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self {
            drivers: Vec::new(),
        }
    }

    pub fn register(&mut self, driver: Arc<dyn DatabaseDriver>) {
        tracing::info!("Registered database driver '{}'", driver.name());
        self.drivers.push(driver);
    }

    pub fn find(&self, url: &str) -> Result<Arc<dyn DatabaseDriver>> {
        self.drivers
            .iter()
            .find(|d| d.accepts(url))
            .cloned()
            .ok_or_else(|| ProxyError::NoProvider(format!("no database driver accepts '{}'", url)))
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}
