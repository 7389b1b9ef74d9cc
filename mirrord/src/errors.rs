use appmirror_api::DeriveError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {

    /* the cluster API is unreachable or rejected the request */
    #[error("kube error: {0}")]
    Connection(#[from] kube::Error),

    /* the watch position is too old for the server to resume from */
    #[error("resume position expired")]
    ResumeExpired,

    #[error("unable to derive key: {0}")]
    Derive(#[from] DeriveError),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("watch failed {0} times in a row, giving up")]
    WatchExhausted(u32),
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
	Error::StoreUnavailable(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
