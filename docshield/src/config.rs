use anyhow::Result;
use config::{Config as ConfigLoader, Environment, File};
use docshield_gateway::cache::CacheConfig;
use docshield_gateway::data_layer::DataLayerConfig;
use docshield_gateway::gateway::GatewayConfig;
use docshield_gateway::observability::{ErrorTrackerConfig, HealthConfig, LogConfig};
use docshield_gateway::resilience::{CircuitBreakerConfig, RetryConfig};
use docshield_metrics::PerformanceConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub port: u16,
    /// Seconds between snapshot log lines; 0 disables them
    pub snapshot_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 3000,
            snapshot_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub log: LogConfig,
    pub cache: CacheConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub errors: ErrorTrackerConfig,
    pub performance: PerformanceConfig,
    pub health: HealthConfig,
    pub gateway: GatewayConfig,
}

impl Settings {
    /// Reads `config/default`, then `config/local`, then `DOCSHIELD__*`
    /// environment variables (e.g. `DOCSHIELD__SERVER__PORT=8080`).
    pub fn load() -> Result<Self> {
        let config = ConfigLoader::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("DOCSHIELD")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn data_layer(&self) -> DataLayerConfig {
        DataLayerConfig {
            cache: self.cache.clone(),
            circuit_breaker: self.circuit_breaker.clone(),
            retry: self.retry.clone(),
            errors: self.errors.clone(),
            performance: self.performance.clone(),
            health: self.health.clone(),
            gateway: self.gateway.clone(),
        }
    }
}
