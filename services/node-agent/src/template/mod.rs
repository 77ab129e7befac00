//! Template material handling.
//!
//! This module handles:
//! - Caching template archives from object storage by checksum
//! - Merging cached layers into an instance's merged directory
//! - Substituting `${VARIABLE}` tokens in merged files
//! - Purging cached templates on request

mod cache;
mod layout;
mod manager;
mod merge;
mod substitute;

pub use cache::{
    CacheConfig, CacheError, CacheLookup, CacheMetadata, LookupOutcome, MissReason, TemplateCache,
};
pub use layout::{require_segment, CacheLayout, CachePaths, SegmentError};
pub use manager::{CacheManager, PurgeError, PurgeTotals};
pub use merge::{merge_layers, LayerSource, MergeError};
pub use substitute::{
    substitute_variables, SubstituteError, SubstitutionReport, DEFAULT_MAX_SUBSTITUTION_BYTES,
};
