use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RbacError {
    #[error("policy line {line}: {message}")]
    InvalidPolicy { line: usize, message: String },
    #[error("unable to read policy file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no policy sources configured")]
    NoSources,
    #[error("casbin error: {0}")]
    Casbin(#[from] casbin::Error),
}

pub type RbacResult<T> = Result<T, RbacError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_variants() {
        let errors = vec![
            RbacError::InvalidPolicy {
                line: 3,
                message: "expected 4 fields".to_string(),
            },
            RbacError::Io {
                path: PathBuf::from("/etc/sessionplane/policy.csv"),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
            },
            RbacError::NoSources,
        ];
        for error in errors {
            assert!(!error.to_string().is_empty());
        }
    }
}
