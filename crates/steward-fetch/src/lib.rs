#![forbid(unsafe_code)]

//! Minimal raw-socket HTTP(S) client for fetching command payloads.
//!
//! The agent deliberately does not use the host application's HTTP
//! facilities for this code path: plugins, proxies, and framework
//! configuration can intercept or rewrite outbound requests, and the
//! payload fetch must behave identically on every install. This client
//! speaks just enough HTTP/1.1 for a single-shot `GET` with
//! `Connection: close`: status line, headers, identity or chunked body.
//!
//! TLS uses the bundled root set, with a one-shot retry against an
//! operator-supplied fallback CA bundle when certificate validation
//! fails (hosts with broken or empty trust stores are a real hazard for
//! embedded agents).

pub mod chunked;
pub mod client;
pub mod error;
mod tls;

pub use chunked::{decode_chunked, encode_chunked};
pub use client::{FetchClient, FetchConfig};
pub use error::FetchError;
