// Origin abstraction — where cache misses are fetched from.

pub mod http_source;
pub mod traits;
