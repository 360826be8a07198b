use thiserror::Error;

/// Failure reading or writing a single cluster object.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    /// The object changed between read and write.
    #[error("object was modified concurrently")]
    Conflict,
    #[error("lookup failed: {0}")]
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
    #[error("discovery record {0} already exists")]
    AlreadyExists(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("discovery store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdoptionError {
    #[error("resource is owned by live instance {owner}; force required")]
    Conflict { owner: String },
}
