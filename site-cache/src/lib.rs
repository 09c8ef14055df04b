//! Read-mostly cache of per-site tracking settings.
//!
//! Entries are loaded from a [`SiteSource`] on first use and expire after the
//! configured TTL, which bounds how stale a lookup can be after the site
//! settings change. Unknown ids are remembered for a few seconds so that a
//! flood of hits for a missing site does not hammer the source.

mod cache;
pub mod config;
pub mod metrics_defs;
mod negative_cache;
pub mod source;
pub mod types;

pub use cache::{SiteCacheError, SiteConfigCache};
pub use config::{SiteCacheConfig, SiteSourceConfig};
pub use source::{FilesystemSiteSource, SiteSource, SourceError, StaticSiteSource};
pub use types::{SiteConfig, SiteId};
