//! Runtime configuration, validated the way the original protocol validates
//! it: `checkInterval ≤ nodeTimeout ≤ masterTimeout` must hold after every
//! successful mutation.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::error::{DiscoverError, Result};

/// How the transport's single socket is operated.
#[derive(Debug, Clone)]
pub enum TransportMode {
    Broadcast { address: String },
    Multicast { group: String, ttl: u8 },
    Unicast { targets: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct Options {
    pub hello_interval: Duration,
    pub check_interval: Duration,
    pub node_timeout: Duration,
    pub master_timeout: Duration,
    pub bind_address: String,
    pub port: u16,
    pub broadcast: String,
    pub multicast: Option<String>,
    pub multicast_ttl: u8,
    pub unicast: Option<Vec<String>>,
    /// Reserved for encryption; accepted but unused by the current protocol.
    pub key: Option<String>,
    pub masters_required: u32,
    pub weight: f64,
    pub client: bool,
    pub reuse_addr: bool,
    pub ignore_process: bool,
    pub ignore_instance: bool,
    pub advertisement: Option<Value>,
    pub hostname: String,
}

/// Fragile by design: the fractional part of the current unix time,
/// negated. Distinct weights are the caller's responsibility for reliable
/// election — see the crate's module docs.
pub fn default_weight() -> f64 {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let fraction = now.subsec_nanos() as f64 / 1_000_000_000.0;
    -fraction
}

fn default_hostname() -> Result<String> {
    hostname::get()
        .map_err(DiscoverError::Hostname)?
        .into_string()
        .map_err(|_| DiscoverError::InvalidOption("hostname"))
}

impl Options {
    /// Build the default option set. `hostname_override` is resolved instead
    /// of the OS hostname when present, so a caller supplying their own
    /// hostname never triggers OS hostname lookup.
    pub fn defaults(hostname_override: Option<String>) -> Result<Self> {
        let hostname = match hostname_override {
            Some(h) => h,
            None => default_hostname()?,
        };
        Ok(Options {
            hello_interval: Duration::from_millis(1000),
            check_interval: Duration::from_millis(2000),
            node_timeout: Duration::from_millis(2000),
            master_timeout: Duration::from_millis(2000),
            bind_address: "0.0.0.0".to_string(),
            port: 12345,
            broadcast: "255.255.255.255".to_string(),
            multicast: None,
            multicast_ttl: 1,
            unicast: None,
            key: None,
            masters_required: 1,
            weight: default_weight(),
            client: false,
            reuse_addr: true,
            ignore_process: true,
            ignore_instance: true,
            advertisement: None,
            hostname,
        })
    }

    /// Mode selection precedence: unicast, else multicast, else broadcast.
    pub fn transport_mode(&self) -> TransportMode {
        if let Some(targets) = &self.unicast {
            TransportMode::Unicast { targets: targets.clone() }
        } else if let Some(group) = &self.multicast {
            TransportMode::Multicast {
                group: group.clone(),
                ttl: self.multicast_ttl,
            }
        } else {
            TransportMode::Broadcast {
                address: self.broadcast.clone(),
            }
        }
    }

    pub fn try_set_check_interval(&mut self, ms: u64) -> Result<()> {
        let candidate = Duration::from_millis(ms);
        if candidate <= self.node_timeout {
            self.check_interval = candidate;
            Ok(())
        } else {
            Err(DiscoverError::InvalidOption("checkInterval"))
        }
    }

    pub fn try_set_node_timeout(&mut self, ms: u64) -> Result<()> {
        let candidate = Duration::from_millis(ms);
        if candidate >= self.check_interval && candidate <= self.master_timeout {
            self.node_timeout = candidate;
            Ok(())
        } else {
            Err(DiscoverError::InvalidOption("nodeTimeout"))
        }
    }

    pub fn try_set_master_timeout(&mut self, ms: u64) -> Result<()> {
        let candidate = Duration::from_millis(ms);
        if candidate >= self.node_timeout {
            self.master_timeout = candidate;
            Ok(())
        } else {
            Err(DiscoverError::InvalidOption("masterTimeout"))
        }
    }

    pub fn set_hello_interval(&mut self, ms: u64) {
        self.hello_interval = Duration::from_millis(ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_satisfy_ordering_invariant() {
        let opts = Options::defaults(Some("test-host".to_string())).unwrap();
        assert!(opts.check_interval <= opts.node_timeout);
        assert!(opts.node_timeout <= opts.master_timeout);
    }

    #[test]
    fn check_interval_rejected_above_node_timeout() {
        let mut opts = Options::defaults(Some("test-host".to_string())).unwrap();
        let err = opts.try_set_check_interval(5000).unwrap_err();
        assert!(matches!(err, DiscoverError::InvalidOption("checkInterval")));
        assert_eq!(opts.check_interval, Duration::from_millis(2000));
    }

    #[test]
    fn node_timeout_accepted_within_bounds() {
        let mut opts = Options::defaults(Some("test-host".to_string())).unwrap();
        opts.try_set_master_timeout(5000).unwrap();
        opts.try_set_node_timeout(3000).unwrap();
        assert_eq!(opts.node_timeout, Duration::from_millis(3000));
    }

    #[test]
    fn node_timeout_rejected_below_check_interval() {
        let mut opts = Options::defaults(Some("test-host".to_string())).unwrap();
        opts.try_set_check_interval(1000).unwrap();
        let err = opts.try_set_node_timeout(500).unwrap_err();
        assert!(matches!(err, DiscoverError::InvalidOption("nodeTimeout")));
    }

    #[test]
    fn master_timeout_rejected_below_node_timeout() {
        let mut opts = Options::defaults(Some("test-host".to_string())).unwrap();
        let err = opts.try_set_master_timeout(1000).unwrap_err();
        assert!(matches!(err, DiscoverError::InvalidOption("masterTimeout")));
    }

    #[test]
    fn transport_mode_precedence_is_unicast_then_multicast_then_broadcast() {
        let mut opts = Options::defaults(Some("test-host".to_string())).unwrap();
        assert!(matches!(opts.transport_mode(), TransportMode::Broadcast { .. }));

        opts.multicast = Some("239.1.1.1".to_string());
        assert!(matches!(opts.transport_mode(), TransportMode::Multicast { .. }));

        opts.unicast = Some(vec!["192.168.1.2".to_string()]);
        assert!(matches!(opts.transport_mode(), TransportMode::Unicast { .. }));
    }
}
