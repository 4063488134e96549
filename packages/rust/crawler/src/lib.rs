//! Source crawling: page fetching, profile-driven extraction, unit
//! enumeration, and the bounded unit worker pool.
//!
//! This crate provides:
//! - [`PageFetcher`]: HTTP GET with timeout and [`RetryPolicy`]
//! - [`CompiledProfile`]: compiled structural queries for one source
//! - [`DescriptorExtractor`]: entry page → descriptor + unit listing
//! - [`enumerate_explicit`] / [`probe_numeric`]: ordered unit enumeration
//! - [`ConcurrentFetcher`]: unit pages → ordered asset lists

pub mod descriptor;
pub mod enumerator;
pub mod fetcher;
pub mod http;
pub mod profile;
pub mod retry;

pub use descriptor::{DescriptorExtractor, EntryPage, UnitListing, inspect_entry};
pub use enumerator::{ProbeOutcome, enumerate_explicit, probe_numeric};
pub use fetcher::{ConcurrentFetcher, FetchBatch, UnitSkip};
pub use http::PageFetcher;
pub use profile::{CompiledProfile, UnitLink, normalize_entry_url};
pub use retry::RetryPolicy;
