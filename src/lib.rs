//! Courier
//!
//! An asynchronous HTTP(S) and WebSocket client engine built on [hyper].
//!
//! A [`Client`] drives each submitted [`Request`] through a transaction:
//! a connection is acquired from the pool (or opened), the request is
//! written, and the response is streamed to an [`AsyncHandler`] as status,
//! headers, body parts and trailers. Redirects and authentication challenges
//! (Basic, Digest, NTLM, proxy authentication) are followed transparently,
//! and connections are returned to the pool when they can be reused.
//!
//! ```no_run
//! # async fn run() -> Result<(), courier::Error> {
//! let client = courier::Client::builder().follow_redirect(true).build();
//! let request = courier::Request::get("http://example.com/").build()?;
//! let response = client.submit(request).await?;
//! println!("{} {}", response.status(), response.body_as_string());
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::fmt;

pub mod auth;
pub mod bridge;
pub mod client;
pub mod config;
mod error;
pub mod filter;
pub mod handler;
pub mod request;
pub mod response;

pub use client::Client;
pub use config::Config;
pub use error::Error;
pub use handler::{AsyncHandler, State};
pub use request::realm::Realm;
pub use request::{Request, RequestBuilder};
pub use response::Response;

/// Boxed error type used for errors produced by collaborators (handlers, transports, bodies).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
