pub mod dav;

pub use dav::DavListing;

use anyhow::Result;

use crate::util::BoxFuture;

/// One directory returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    /// Absolute remote path, as reported by the server.
    pub path: String,
    /// Bytes used below the directory (advisory).
    pub size: u64,
}

impl ListedEntry {
    pub fn new(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            size,
        }
    }
}

/// Lists the immediate sub-directories of a remote directory.
///
/// The first entry of a successful result is the listed directory itself.
pub trait ListingService: Send + Sync {
    fn list<'a>(
        &'a self,
        base_url: &'a str,
        relative_path: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ListedEntry>>>;
}
