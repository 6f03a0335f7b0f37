//! Network layer: readiness reactor, TCP+TLS sockets, the TLS-terminating
//! acceptor, and the DNS resolver.

pub(crate) mod reactor;

pub mod dns;
mod listener;
mod opts;
mod socket;
pub(crate) mod tls;

pub use self::listener::{AcceptorOpts, Listener, SslDisable};
pub use self::opts::{CloseOpts, CloseType, OpenOpts, Ready, SockOpts, WaitOpts};
pub use self::socket::{connect, Socket};

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A remote endpoint named by hostname, with an optional explicit port and
/// an optional SRV service prefix (e.g. `_matrix._tcp`).
///
/// The hostname is the canonical peer key in the request pipeline; the
/// resolver turns it into addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
    pub service: Option<String>,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> HostPort {
        HostPort {
            host: host.into(),
            port,
            service: None,
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> HostPort {
        self.service = Some(service.into());
        self
    }

    /// Parse `host[:port]`, defaulting the port.
    pub fn parse(s: &str, default_port: u16) -> HostPort {
        // a bare IPv6 literal is all colons, not a port separator
        if s.parse::<std::net::Ipv6Addr>().is_ok() {
            return HostPort::new(s, default_port);
        }
        match s.rsplit_once(':') {
            Some((host, port)) if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => {
                HostPort::new(host, port.parse().unwrap_or(default_port))
            }
            _ => HostPort::new(s, default_port),
        }
    }

    /// The literal address, when the host is an IP and no DNS is needed.
    pub fn literal(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }

    /// The SRV query name, when a service prefix is set.
    pub fn srv_name(&self) -> Option<String> {
        self.service
            .as_ref()
            .map(|service| format!("{}.{}", service, self.host))
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hostport_parse() {
        let hp = HostPort::parse("example.org:8448", 443);
        assert_eq!(hp.host, "example.org");
        assert_eq!(hp.port, 8448);

        let hp = HostPort::parse("example.org", 443);
        assert_eq!(hp.port, 443);

        let hp = HostPort::parse("2001:db8::1", 443);
        assert_eq!(hp.host, "2001:db8::1");
        assert!(hp.literal().is_some());
    }

    #[test]
    fn srv_name_composition() {
        let hp = HostPort::new("example.org", 0).with_service("_matrix._tcp");
        assert_eq!(hp.srv_name().unwrap(), "_matrix._tcp.example.org");
    }
}
