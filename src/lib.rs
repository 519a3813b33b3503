//! RSS Aggregator
//!
//! Periodically fetches RSS feeds in bounded, staleness-ordered batches and
//! stores their items as posts that users can list through a small JSON API.

pub mod config;
pub mod db;
pub mod fetcher;
pub mod routes;
pub mod scheduler;
