//! Regional endpoint selection and single-hop failover.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use catmirror_core::ConfigError;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::http::{CatalogRequest, RequestError, ResilienceClient, TransportResponse};
use crate::shutdown::ShutdownSignal;

fn default_fallback_region() -> String {
    "us".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Region name -> base URL of that region's catalog API.
    pub endpoints: BTreeMap<String, String>,
    #[serde(default)]
    pub default_region: Option<String>,
    #[serde(default = "default_fallback_region")]
    pub fallback_region: String,
    #[serde(default)]
    pub host_overrides: BTreeMap<String, String>,
}

impl Default for RegionConfig {
    fn default() -> Self {
        let mut endpoints = BTreeMap::new();
        endpoints.insert("eu".to_string(), "https://api.eu.socrata.com".to_string());
        endpoints.insert("us".to_string(), "https://api.us.socrata.com".to_string());
        Self {
            endpoints,
            default_region: None,
            fallback_region: default_fallback_region(),
            host_overrides: BTreeMap::new(),
        }
    }
}

impl RegionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.require(&self.fallback_region, "fallback_region")?;
        if let Some(default_region) = &self.default_region {
            self.require(default_region, "default_region")?;
        }
        for (host, region) in &self.host_overrides {
            self.require(region, &format!("host override for {host}"))?;
        }
        Ok(())
    }

    fn require(&self, region: &str, referenced_by: &str) -> Result<(), ConfigError> {
        if self.endpoints.contains_key(region) {
            Ok(())
        } else {
            Err(ConfigError::UnknownRegion {
                region: region.to_string(),
                referenced_by: referenced_by.to_string(),
            })
        }
    }

    fn endpoint(&self, region: &str) -> Option<RegionEndpoint> {
        self.endpoints.get(region).map(|base_url| RegionEndpoint {
            region: region.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionEndpoint {
    pub region: String,
    pub base_url: String,
}

/// Failover policy: 5xx and network errors qualify; every 4xx (401/403/429 included) does not.
pub fn should_failover(status: Option<u16>, is_network_error: bool) -> bool {
    is_network_error || status.is_some_and(|s| (500..=599).contains(&s))
}

/// Per-run router. Holds a config snapshot and caches each host's resolution,
/// so configuration changes never reach hosts an in-flight run already resolved.
#[derive(Debug)]
pub struct RegionalRouter {
    config: RegionConfig,
    resolved: Mutex<HashMap<String, RegionEndpoint>>,
}

impl RegionalRouter {
    pub fn new(config: RegionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            resolved: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    /// Override, then global default, then the fixed fallback.
    pub fn resolve_endpoint(&self, host: &str) -> Result<RegionEndpoint, ConfigError> {
        let key = host.trim().to_ascii_lowercase();
        let mut resolved = self.resolved.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(endpoint) = resolved.get(&key) {
            return Ok(endpoint.clone());
        }

        let region = self
            .config
            .host_overrides
            .get(&key)
            .or(self.config.default_region.as_ref())
            .unwrap_or(&self.config.fallback_region);
        let endpoint = self
            .config
            .endpoint(region)
            .ok_or_else(|| ConfigError::UnknownRegion {
                region: region.clone(),
                referenced_by: format!("host {key}"),
            })?;
        resolved.insert(key, endpoint.clone());
        Ok(endpoint)
    }

    /// First other region by name, if any.
    pub fn alternate_endpoint(&self, host: &str) -> Result<Option<RegionEndpoint>, ConfigError> {
        let primary = self.resolve_endpoint(host)?;
        Ok(self
            .config
            .endpoints
            .keys()
            .find(|region| **region != primary.region)
            .and_then(|region| self.config.endpoint(region)))
    }
}

#[derive(Debug, Clone)]
pub struct RegionalResponse {
    pub response: TransportResponse,
    pub endpoint: RegionEndpoint,
    pub failed_over: bool,
}

/// Resilience client wrapped with at most one regional failover per logical request.
pub struct RegionalClient {
    client: Arc<ResilienceClient>,
    router: Arc<RegionalRouter>,
}

impl RegionalClient {
    pub fn new(client: Arc<ResilienceClient>, router: Arc<RegionalRouter>) -> Self {
        Self { client, router }
    }

    pub fn router(&self) -> &RegionalRouter {
        &self.router
    }

    pub fn resilience(&self) -> &ResilienceClient {
        &self.client
    }

    pub async fn execute<F>(
        &self,
        host: &str,
        shutdown: &ShutdownSignal,
        build: F,
    ) -> Result<RegionalResponse, RequestError>
    where
        F: Fn(&RegionEndpoint) -> CatalogRequest,
    {
        let primary = self.router.resolve_endpoint(host)?;
        let err = match self.client.execute(&build(&primary), shutdown).await {
            Ok(response) => {
                return Ok(RegionalResponse {
                    response,
                    endpoint: primary,
                    failed_over: false,
                })
            }
            Err(err) => err,
        };

        if !should_failover(err.last_status(), err.is_network()) {
            return Err(err);
        }
        let Some(alternate) = self.router.alternate_endpoint(host)? else {
            return Err(err);
        };

        warn!(
            host,
            from = %primary.region,
            to = %alternate.region,
            error = %err,
            "failover to alternate region"
        );
        let response = self.client.execute(&build(&alternate), shutdown).await?;
        Ok(RegionalResponse {
            response,
            endpoint: alternate,
            failed_over: true,
        })
    }
}
