//! Transport pool: keyed `reqwest::Client` construction with a three-level
//! config merge and an optional SSRF address filter (§4.4).
//!
//! Generalizes the ad hoc `reqwest::Client::builder()` call inlined in
//! `kairos-rs::services::http::RouteHandler::new`, which built one client
//! for the whole handler with a fixed idle timeout and pool size. This pulls
//! client construction out into a pool keyed by upstream name, each built
//! from `defaults ← global ← per-upstream` `TransportConfig`s.

use crate::models::settings::TransportConfig;
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::Duration;

pub struct Transport {
    pub client: reqwest::Client,
    config: TransportConfig,
}

impl Transport {
    fn build(config: TransportConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .tcp_nodelay(config.tcp_nodelay)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        Ok(Self { client, config })
    }

    /// Resolves `host` and rejects the dial if any resolved address falls in
    /// a configured deny CIDR. No-op when the filter isn't enabled.
    pub async fn check_ssrf(&self, host: &str) -> Result<(), String> {
        check_ssrf(&self.config, host).await
    }
}

/// Resolves `host` and rejects the dial if any resolved address falls in a
/// configured deny CIDR. No-op when `config.ssrf_filter_enabled` is false.
/// Split out of [`Transport::check_ssrf`] so callers that only hold a
/// [`TransportConfig`] (not a built `Transport`) can run the same check
/// without taking a lock across the DNS lookup's `.await`.
async fn check_ssrf(config: &TransportConfig, host: &str) -> Result<(), String> {
    if !config.ssrf_filter_enabled {
        return Ok(());
    }
    let deny: Vec<IpNet> = config.ssrf_deny_cidrs.iter().filter_map(|s| s.parse().ok()).collect();

    let lookup = format!("{host}:0");
    let addrs = tokio::net::lookup_host(lookup).await.map_err(|e| format!("dns resolution failed for {host}: {e}"))?;

    for addr in addrs {
        let ip: IpAddr = addr.ip();
        if deny.iter().any(|net| net.contains(&ip)) {
            return Err(format!("address {ip} for host {host} is denied by SSRF filter"));
        }
    }
    Ok(())
}

/// Transports are built eagerly at reload for each upstream with overrides,
/// on-demand for the unnamed default. Readers get an `Arc`-free reference
/// behind a `RwLock`; replaced on the next reload once all referencing
/// `RouteProxy`s have moved to the new generation (§4.4 lifecycle).
pub struct TransportPool {
    defaults: TransportConfig,
    named: RwLock<HashMap<String, Transport>>,
    default_transport: RwLock<Option<Transport>>,
}

impl TransportPool {
    pub fn new(defaults: TransportConfig, overrides: &[(String, TransportConfig)]) -> Result<Self, reqwest::Error> {
        let mut named = HashMap::new();
        for (name, cfg) in overrides {
            let merged = defaults.merged_with(cfg);
            named.insert(name.clone(), Transport::build(merged)?);
        }
        Ok(Self { defaults, named: RwLock::new(named), default_transport: RwLock::new(None) })
    }

    /// Returns the client for a named transport, or lazily builds and
    /// caches the default one if `upstream_key` is `None`.
    pub fn client_for(&self, upstream_key: Option<&str>) -> Result<reqwest::Client, reqwest::Error> {
        if let Some(name) = upstream_key {
            if let Some(t) = self.named.read().unwrap().get(name) {
                return Ok(t.client.clone());
            }
        }
        if let Some(t) = self.default_transport.read().unwrap().as_ref() {
            return Ok(t.client.clone());
        }
        let transport = Transport::build(self.defaults.clone())?;
        let client = transport.client.clone();
        *self.default_transport.write().unwrap() = Some(transport);
        Ok(client)
    }

    /// Runs the SSRF filter configured for `upstream_key`'s transport
    /// against `host` (§4.4). Clones the small bit of config needed rather
    /// than holding a lock across the DNS lookup `.await`.
    pub async fn check_ssrf(&self, upstream_key: Option<&str>, host: &str) -> Result<(), String> {
        let config = self.config_for(upstream_key);
        check_ssrf(&config, host).await
    }

    fn config_for(&self, upstream_key: Option<&str>) -> TransportConfig {
        if let Some(name) = upstream_key {
            if let Some(t) = self.named.read().unwrap().get(name) {
                return t.config.clone();
            }
        }
        if let Some(t) = self.default_transport.read().unwrap().as_ref() {
            return t.config.clone();
        }
        self.defaults.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_default_transport_on_demand() {
        let pool = TransportPool::new(TransportConfig::default(), &[]).unwrap();
        assert!(pool.client_for(None).is_ok());
    }

    #[test]
    fn named_override_is_available_by_key() {
        let overrides = vec![("slow-upstream".to_string(), TransportConfig { connect_timeout_ms: 60_000, ..TransportConfig::default() })];
        let pool = TransportPool::new(TransportConfig::default(), &overrides).unwrap();
        assert!(pool.client_for(Some("slow-upstream")).is_ok());
    }

    #[tokio::test]
    async fn ssrf_filter_noop_when_disabled() {
        let transport = Transport::build(TransportConfig::default()).unwrap();
        assert!(transport.check_ssrf("example.com").await.is_ok());
    }

    #[tokio::test]
    async fn ssrf_filter_rejects_loopback_when_enabled() {
        let config = TransportConfig {
            ssrf_filter_enabled: true,
            ssrf_deny_cidrs: vec!["127.0.0.0/8".to_string()],
            ..TransportConfig::default()
        };
        let transport = Transport::build(config).unwrap();
        assert!(transport.check_ssrf("127.0.0.1").await.is_err());
    }
}
