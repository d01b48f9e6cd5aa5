//! moonlight-host library
//!
//! Moonlight/GameStream-compatible remote desktop and game streaming host,
//! usable as a library for integration tests and reuse.

#[cfg(feature = "tls")]
pub mod admin;
pub mod config;
pub mod control;
pub mod crypto;
pub mod encoder;
pub mod error;
pub mod fec;
pub mod health;
pub mod host_info;
pub mod http;
#[cfg(feature = "tls")]
pub mod https;
pub mod identity;
pub mod input_interpreter;
pub mod input_sink;
pub mod pairing;
pub mod rtp;
pub mod rtsp;
pub mod runner;
pub mod session;
#[cfg(feature = "tls")]
pub mod tls;
pub mod xml;
