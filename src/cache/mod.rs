pub mod entry;
pub mod flight;
pub mod key;
pub mod refreshing;
pub mod store;

pub use key::PodIdentity;
pub use refreshing::{RefreshingCache, RefreshingCacheOpts};
