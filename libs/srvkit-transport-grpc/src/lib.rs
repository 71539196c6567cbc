#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod client;
pub mod codec;

/// Reserved metadata key carrying the caller's configured application name.
///
/// Outbound calls always overwrite this entry so callees can trust it for
/// permission checks.
pub const ORIGIN_METADATA_KEY: &str = "origin";

use tonic::metadata::{AsciiMetadataValue, MetadataMap};

/// Set the origin entry, replacing any value the caller supplied.
pub fn attach_origin(meta: &mut MetadataMap, origin: &AsciiMetadataValue) {
    meta.insert(ORIGIN_METADATA_KEY, origin.clone());
}

/// Read the origin entry, if present and valid ASCII.
pub fn extract_origin(meta: &MetadataMap) -> Option<&str> {
    meta.get(ORIGIN_METADATA_KEY).and_then(|v| v.to_str().ok())
}
