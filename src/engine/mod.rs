// Engine — disk cache, single-flight coordination, tee downloads and warm-up.

pub mod cache;
pub mod flight;
pub mod stats;
pub mod store;
pub mod tee;
pub mod warmup;
