//! The interception boundary: what a request and a response look like,
//! and how a real network fetch is performed.

mod client;
mod types;

pub use client::{Fetcher, HttpFetcher, NetworkError};
pub use types::{Destination, Request, ResponseSnapshot};
