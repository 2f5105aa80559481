pub mod rate_limit;
pub mod sweeper;

pub use rate_limit::TokenBucket;
pub use sweeper::{Sweeper, SweeperOpts};
