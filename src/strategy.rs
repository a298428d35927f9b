//! Cache-aside strategies.

/// How a cache-aside operation treats the cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CacheStrategy {
    /// Cache only; never run the factory.
    Fresh,
    /// Read through the cache, compute and store on miss.
    #[default]
    Refresh,
    /// Remove the key, then compute and store.
    Invalidate,
    /// Skip the cache read, compute, and still store the result.
    Bypass,
}

impl std::fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheStrategy::Fresh => write!(f, "Fresh"),
            CacheStrategy::Refresh => write!(f, "Refresh"),
            CacheStrategy::Invalidate => write!(f, "Invalidate"),
            CacheStrategy::Bypass => write!(f, "Bypass"),
        }
    }
}
