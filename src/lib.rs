//! Propline: streaming ingestion of player projection feeds into a keyed store
//!
//! A feed is one large JSON document: a `data` array of projections and an
//! `included` side table of the players and leagues they reference. Ingestion
//! runs as a single pass over the raw text:
//!
//! 1. **Side-table pass** -- Locate the envelope and build O(1) player/league
//!    lookup maps from `included` without parsing `data`
//! 2. **Record stream** -- Scan `data` one element at a time, map each to a
//!    canonical record, drop anything that is not `pre_game`
//! 3. **Batched commits** -- Buffer records and commit them with their
//!    composite index entries as atomic batches sized from the input length
//! 4. **Rebuild** (optional) -- After a fast import, recompute the composite
//!    index and player counts from the stored records
//!
//! # Architecture
//!
//! - **Lazy extraction** -- Depth-counted bracket scanning with `memchr`; one
//!   element is parsed at a time, never the whole array
//! - **Total mapping** -- Unresolvable references become `"Unknown"` instead of
//!   failing the element
//! - **Atomic batches** -- Records, index entries and player counts land in the
//!   same transaction, retried once on failure
//! - **Background passes** -- Passes run on the tokio blocking pool and report
//!   throttled progress over a channel
//! - **Resumable processing** -- Checkpoints record the element boundary after
//!   the last committed batch
//!
//! # Key Modules
//!
//! - [`extract`] -- Envelope location and the lazy element iterator
//! - [`resolver`] -- Side-table lookup maps
//! - [`mapper`] -- Raw element to [`models::CanonicalRecord`]
//! - [`writer`] -- Adaptive batch sizing and flushing
//! - [`ingest`] -- The pass itself: state machine, cancellation, progress
//! - [`task`] -- Async handles over ingestion and rebuild
//! - [`rebuild`] -- Composite index and player count recomputation
//! - [`store`] -- Store contract with in-memory and file-backed implementations
//! - [`export`] -- CSV export
//! - [`checkpoint`] -- Resume markers
//! - [`stats`] -- Thread-safe atomic counters for pass metrics
//! - [`config`] -- Constants for batching, progress and persistence
//!
//! # Example Usage
//!
//! ```bash
//! # Fast import, then rebuild the index in one go
//! propline ingest -i projections.json -s store/ --fast --rebuild
//!
//! # Autocomplete players in a league/stat
//! propline lookup -s store/ --league NBA --stat Points --player "Le"
//! ```

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod export;
pub mod extract;
pub mod ingest;
pub mod mapper;
pub mod models;
pub mod progress;
pub mod rebuild;
pub mod resolver;
pub mod stats;
pub mod store;
pub mod task;
pub mod writer;
