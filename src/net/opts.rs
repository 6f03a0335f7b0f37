//! Option bags for socket open, wait and close.

use std::net::SocketAddr;
use std::time::Duration;

use crate::config::Config;

use super::HostPort;

/// Readiness classes a wait can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ready {
    Read,
    Write,
    Error,
}

/// Socket-level options applied at open or accept.
///
/// `read_lowat`/`write_lowat` are accepted and ignored; low-watermark
/// semantics never affected this stack's behavior.
#[derive(Debug, Clone, Default)]
pub struct SockOpts {
    pub nodelay: Option<bool>,
    pub keepalive: Option<bool>,
    pub linger: Option<Duration>,
    pub read_lowat: Option<usize>,
    pub write_lowat: Option<usize>,
}

/// Everything `connect` needs to open one socket.
#[derive(Clone)]
pub struct OpenOpts {
    /// The address to dial.
    pub ipport: SocketAddr,
    /// The remote's canonical name; default source of SNI and certificate
    /// name checks.
    pub hostport: HostPort,
    /// Overrides the name used for certificate verification.
    pub common_name: Option<String>,
    /// Overrides the name offered in SNI.
    pub server_name: Option<String>,
    pub send_sni: bool,
    /// Initiate TLS after connect.
    pub handshake: bool,
    pub verify_certificate: bool,
    pub allow_self_signed: bool,
    pub allow_self_chain: bool,
    pub allow_expired: bool,
    pub verify_common_name: bool,
    pub verify_self_signed_common_name: bool,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub sopts: SockOpts,
}

impl OpenOpts {
    pub fn new(ipport: SocketAddr, hostport: HostPort) -> OpenOpts {
        OpenOpts {
            ipport,
            hostport,
            common_name: None,
            server_name: None,
            send_sni: true,
            handshake: true,
            verify_certificate: true,
            allow_self_signed: false,
            allow_self_chain: false,
            allow_expired: false,
            verify_common_name: true,
            verify_self_signed_common_name: true,
            connect_timeout: Duration::from_millis(7500),
            handshake_timeout: Duration::from_millis(7500),
            sopts: SockOpts::default(),
        }
    }

    /// Defaults drawn from the configuration surface.
    pub fn from_config(config: &Config, ipport: SocketAddr, hostport: HostPort) -> OpenOpts {
        let mut opts = OpenOpts::new(ipport, hostport);
        opts.verify_certificate = config.verify_certificate;
        opts.allow_self_signed = config.allow_self_signed;
        opts.allow_self_chain = config.allow_self_chain;
        opts.allow_expired = config.allow_expired;
        opts.connect_timeout = config.connect_timeout;
        opts.handshake_timeout = config.handshake_timeout;
        opts
    }

    /// The name offered in SNI.
    pub(crate) fn sni_name(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.hostport.host)
    }

    /// The name certificates are checked against.
    pub(crate) fn verify_name(&self) -> &str {
        self.common_name.as_deref().unwrap_or(&self.hostport.host)
    }
}

/// How a wait resumes.
#[derive(Debug, Clone, Copy)]
pub struct WaitOpts {
    pub ready: Ready,
    pub timeout: Option<Duration>,
}

impl WaitOpts {
    pub fn read() -> WaitOpts {
        WaitOpts {
            ready: Ready::Read,
            timeout: None,
        }
    }

    pub fn write() -> WaitOpts {
        WaitOpts {
            ready: Ready::Write,
            timeout: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> WaitOpts {
        self.timeout = Some(timeout);
        self
    }
}

/// Close strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseType {
    /// Hard reset: linger zero, no shutdown sequence.
    Rst,
    /// Shut down both directions.
    Fin,
    /// Shut down the send side only.
    FinSend,
    /// Shut down the receive side only.
    FinRecv,
    /// TLS close_notify, then drain until EOF.
    SslNotify,
}

#[derive(Debug, Clone, Copy)]
pub struct CloseOpts {
    pub r#type: CloseType,
    pub timeout: Duration,
}

impl Default for CloseOpts {
    fn default() -> CloseOpts {
        CloseOpts {
            r#type: CloseType::SslNotify,
            timeout: Duration::from_millis(7500),
        }
    }
}

impl CloseOpts {
    pub fn from_config(config: &Config, r#type: CloseType) -> CloseOpts {
        CloseOpts {
            r#type,
            timeout: config.close_timeout,
        }
    }
}
