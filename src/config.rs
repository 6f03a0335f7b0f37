//! Name-valued configuration surface.
//!
//! Every tunable of the execution engine, the network layer and the request
//! pipeline lives here with its default. An embedding server can address
//! items by their dotted name (`"net.dns.resolver.timeout"`) through
//! [`Config::set`] / [`Config::get`], so this crate stays independent of any
//! particular configuration file format.

use std::time::Duration;

use crate::{Error, Result};

/// All tunables, with the documented defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// `net.enable_ipv6` - whether AAAA resolution and v6 endpoints are used.
    pub enable_ipv6: bool,
    /// `net.close.timeout` - orderly close drain budget, in milliseconds.
    pub close_timeout: Duration,
    /// `net.open.connect_timeout` - TCP connect budget, in milliseconds.
    pub connect_timeout: Duration,
    /// `net.open.handshake_timeout` - TLS handshake budget, in milliseconds.
    pub handshake_timeout: Duration,
    /// `net.open.verify_certificate`
    pub verify_certificate: bool,
    /// `net.open.allow_self_signed`
    pub allow_self_signed: bool,
    /// `net.open.allow_self_chain`
    pub allow_self_chain: bool,
    /// `net.open.allow_expired`
    pub allow_expired: bool,
    /// `net.acceptor.timeout` - inbound handshake budget, in milliseconds.
    pub acceptor_timeout: Duration,
    /// `net.acceptor.handshaking.max` - concurrent inbound handshakes.
    pub handshaking_max: usize,
    /// `net.acceptor.handshaking.max_per_peer` - per remote IP.
    pub handshaking_max_per_peer: usize,
    /// `net.dns.resolver.servers` - semicolon-separated `ip[:port]` list.
    pub dns_servers: String,
    /// `net.dns.resolver.timeout` - per-attempt budget, in milliseconds.
    pub dns_timeout: Duration,
    /// `net.dns.resolver.send_rate` - pacing interval after the burst.
    pub dns_send_rate: Duration,
    /// `net.dns.resolver.send_burst` - queries sent before pacing begins.
    pub dns_send_burst: usize,
    /// `net.dns.resolver.retry_max` - attempts before `timed_out`.
    pub dns_retry_max: u8,
    /// `net.dns.cache.min_ttl` - floor applied to cached record TTLs, seconds.
    pub dns_min_ttl: Duration,
    /// `net.dns.cache.clear_nxdomain` - negative-cache lifetime, seconds.
    pub dns_clear_nxdomain: Duration,
    /// `server.peer.link.min`
    pub link_min: usize,
    /// `server.peer.link.max`
    pub link_max: usize,
    /// `server.peer.remote.ttl.min` - resolution reuse floor, seconds.
    pub remote_ttl_min: Duration,
    /// `server.peer.remote.ttl.max` - resolution reuse ceiling, seconds.
    pub remote_ttl_max: Duration,
    /// `server.peer.error.clear_default` - error cool-down, seconds.
    pub error_clear: Duration,
    /// `server.link.tag_commit_max` - concurrent pipelined requests per link.
    pub tag_commit_max: usize,
    /// `server.link.tag_max` - total tags admitted to one link's queue.
    pub tag_max: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            enable_ipv6: true,
            close_timeout: Duration::from_millis(7500),
            connect_timeout: Duration::from_millis(7500),
            handshake_timeout: Duration::from_millis(7500),
            verify_certificate: true,
            allow_self_signed: false,
            allow_self_chain: false,
            allow_expired: false,
            acceptor_timeout: Duration::from_millis(12000),
            handshaking_max: 64,
            handshaking_max_per_peer: 16,
            dns_servers: "4.2.2.1;4.2.2.2;4.2.2.3;4.2.2.4;4.2.2.5;4.2.2.6".into(),
            dns_timeout: Duration::from_millis(10000),
            dns_send_rate: Duration::from_millis(60),
            dns_send_burst: 8,
            dns_retry_max: 4,
            dns_min_ttl: Duration::from_secs(900),
            dns_clear_nxdomain: Duration::from_secs(43200),
            link_min: 1,
            link_max: 4,
            remote_ttl_min: Duration::from_secs(21600),
            remote_ttl_max: Duration::from_secs(259200),
            error_clear: Duration::from_secs(305),
            tag_commit_max: 3,
            tag_max: 16384,
        }
    }
}

macro_rules! items {
    ($($name:literal => $field:ident: $kind:tt,)*) => {
        impl Config {
            /// Set one item by its dotted name. Durations take an integer in
            /// the unit their name documents (milliseconds or seconds).
            pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
                match name {
                    $($name => items!(@set self, $field, value, $kind),)*
                    _ => return Err(Error::new_unavailable(format!("unknown config item {}", name))),
                }
                tracing::debug!(name, value, "config set");
                Ok(())
            }

            /// Render one item by its dotted name.
            pub fn get(&self, name: &str) -> Option<String> {
                match name {
                    $($name => Some(items!(@get self, $field, $kind)),)*
                    _ => None,
                }
            }
        }
    };
    (@set $s:ident, $f:ident, $v:ident, bool) => {
        $s.$f = matches!($v, "true" | "1" | "yes")
    };
    (@set $s:ident, $f:ident, $v:ident, usize) => {
        $s.$f = $v.parse().map_err(|e| Error::new_unavailable(format!("{}", e)))?
    };
    (@set $s:ident, $f:ident, $v:ident, u8) => {
        $s.$f = $v.parse().map_err(|e| Error::new_unavailable(format!("{}", e)))?
    };
    (@set $s:ident, $f:ident, $v:ident, string) => {
        $s.$f = $v.to_owned()
    };
    (@set $s:ident, $f:ident, $v:ident, millis) => {
        $s.$f = Duration::from_millis($v.parse().map_err(|e| Error::new_unavailable(format!("{}", e)))?)
    };
    (@set $s:ident, $f:ident, $v:ident, seconds) => {
        $s.$f = Duration::from_secs($v.parse().map_err(|e| Error::new_unavailable(format!("{}", e)))?)
    };
    (@get $s:ident, $f:ident, bool) => { $s.$f.to_string() };
    (@get $s:ident, $f:ident, usize) => { $s.$f.to_string() };
    (@get $s:ident, $f:ident, u8) => { $s.$f.to_string() };
    (@get $s:ident, $f:ident, string) => { $s.$f.clone() };
    (@get $s:ident, $f:ident, millis) => { $s.$f.as_millis().to_string() };
    (@get $s:ident, $f:ident, seconds) => { $s.$f.as_secs().to_string() };
}

items! {
    "net.enable_ipv6" => enable_ipv6: bool,
    "net.close.timeout" => close_timeout: millis,
    "net.open.connect_timeout" => connect_timeout: millis,
    "net.open.handshake_timeout" => handshake_timeout: millis,
    "net.open.verify_certificate" => verify_certificate: bool,
    "net.open.allow_self_signed" => allow_self_signed: bool,
    "net.open.allow_self_chain" => allow_self_chain: bool,
    "net.open.allow_expired" => allow_expired: bool,
    "net.acceptor.timeout" => acceptor_timeout: millis,
    "net.acceptor.handshaking.max" => handshaking_max: usize,
    "net.acceptor.handshaking.max_per_peer" => handshaking_max_per_peer: usize,
    "net.dns.resolver.servers" => dns_servers: string,
    "net.dns.resolver.timeout" => dns_timeout: millis,
    "net.dns.resolver.send_rate" => dns_send_rate: millis,
    "net.dns.resolver.send_burst" => dns_send_burst: usize,
    "net.dns.resolver.retry_max" => dns_retry_max: u8,
    "net.dns.cache.min_ttl" => dns_min_ttl: seconds,
    "net.dns.cache.clear_nxdomain" => dns_clear_nxdomain: seconds,
    "server.peer.link.min" => link_min: usize,
    "server.peer.link.max" => link_max: usize,
    "server.peer.remote.ttl.min" => remote_ttl_min: seconds,
    "server.peer.remote.ttl.max" => remote_ttl_max: seconds,
    "server.peer.error.clear_default" => error_clear: seconds,
    "server.link.tag_commit_max" => tag_commit_max: usize,
    "server.link.tag_max" => tag_max: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented() {
        let c = Config::default();
        assert_eq!(c.connect_timeout, Duration::from_millis(7500));
        assert_eq!(c.handshaking_max, 64);
        assert_eq!(c.dns_send_burst, 8);
        assert_eq!(c.link_max, 4);
        assert_eq!(c.tag_commit_max, 3);
        assert_eq!(c.error_clear, Duration::from_secs(305));
    }

    #[test]
    fn set_get_by_name() {
        let mut c = Config::default();
        c.set("server.peer.link.max", "8").unwrap();
        assert_eq!(c.link_max, 8);
        assert_eq!(c.get("server.peer.link.max").unwrap(), "8");
        c.set("net.dns.resolver.timeout", "2500").unwrap();
        assert_eq!(c.dns_timeout, Duration::from_millis(2500));
        assert!(c.set("no.such.item", "1").is_err());
    }
}
