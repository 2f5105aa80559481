use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Clock used by the cache and the sweeper to read wall-clock time.
/// Injectable so tests can steer entry expiry deterministically.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}
