//! Offline-first request cache.
//!
//! Every request the application makes passes through a [`engine::Registration`].
//! The controlling [`engine::CacheEngine`] classifies it and answers from a
//! versioned cache namespace, from the network, or both:
//! - page loads: network first, then cache, fallback document, offline page
//! - the metadata manifest: stale-while-revalidate
//! - static assets: cache first, bounded by trimming
//! - everything else: straight to the network
//!
//! A new version installs next to the running one and only takes over when
//! the application sends `ADOPT_NEW_VERSION`.

pub mod cache;
pub mod config;
pub mod engine;
pub mod net;

#[cfg(test)]
mod testing;
