//! # fedlink
//!
//! The concurrency, networking and request-pipelining core of a
//! TLS-secured HTTP federation server.
//!
//! Three layered components, leaf first:
//!
//! - **[`exec`]** - a single-threaded cooperative execution engine: tasks,
//!   docks (ordered condition variables), mutexes, queues, promises and
//!   futures, worker pools, and an offload path for genuinely blocking
//!   calls. Interruption and timeouts are first-class.
//! - **[`net`]** - sockets (TCP + TLS) over a readiness reactor, with
//!   four-way read/write contracts, certificate-policy verification, a
//!   TLS-terminating listener with SNI/ALPN dispatch, and a DNS resolver
//!   with a TTL-bounded cache.
//! - **[`client`]** - an HTTP/1.1 pipeliner organizing requests into
//!   peers and links, preserving per-link FIFO order, parsing fixed and
//!   chunked bodies, and surviving cancellation of in-flight requests.
//!
//! Everything runs on one OS thread inside [`exec::Runtime::run`]; foreign
//! threads only appear behind [`exec::offload`] and wake the reactor
//! through its injection queue.
//!
//! ## Example
//!
//! ```no_run
//! use fedlink::{client, exec, net, Config};
//!
//! let rt = exec::Runtime::new(Config::default()).unwrap();
//! rt.run(async {
//!     let client = client::Client::new(Config::default()).unwrap();
//!     let request = client::Request::new(
//!         "GET /_matrix/federation/v1/version HTTP/1.1\r\nHost: example.org\r\n\r\n",
//!     );
//!     let hostport = net::HostPort::new("example.org", 8448);
//!     let response = client.submit(&hostport, request).get().await.unwrap();
//!     println!("{}", response.status);
//! });
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod exec;
pub mod net;

pub use crate::config::Config;
pub use crate::error::{Error, Result};
