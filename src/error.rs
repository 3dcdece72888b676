//! Error types for deferq.

use thiserror::Error;

use crate::model::Job;

#[derive(Debug, Error)]
pub enum Error {
    /// A dependency has not produced its value yet. Drives requeue-with-backoff.
    #[error("result pending for job {0}")]
    Pending(Job),

    /// Jobs completed without leaving a recorded return value.
    #[error("result missing for {} job(s): {}", .0.len(), join_jobs(.0))]
    Missing(Vec<Job>),

    #[error("no remote representation: {0}")]
    NoRemoteRepresentation(String),

    #[error("lock not acquired within timeout: {0}")]
    Locked(String),

    #[error("unknown method: {0}")]
    UnknownMethod(String),

    #[error("unknown runner kind: {0}")]
    UnknownRunner(String),

    #[error("registration error: {0}")]
    Registration(String),

    #[error("no job is executing in this context")]
    NotInWorker,

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("work failed: {0:#}")]
    Work(anyhow::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Recover a crate error carried inside a work method's `anyhow::Error`,
    /// wrapping anything else as [`Error::Work`].
    pub fn from_work(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(e) => e,
            Err(other) => Error::Work(other),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Error::Pending(_))
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Error::Missing(_))
    }
}

fn join_jobs(jobs: &[Job]) -> String {
    jobs.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_work_recovers_crate_error() {
        let wrapped = anyhow::Error::new(Error::Pending(Job::new(7, "mem")));
        assert!(Error::from_work(wrapped).is_pending());

        let foreign = anyhow::anyhow!("boom");
        match Error::from_work(foreign) {
            Error::Work(e) => assert_eq!(e.to_string(), "boom"),
            other => panic!("expected Work, got {other:?}"),
        }
    }

    #[test]
    fn missing_names_every_job() {
        let err = Error::Missing(vec![Job::new(1, "mem"), Job::new(2, "mem")]);
        let msg = err.to_string();
        assert!(msg.contains("2 job(s)"));
        assert!(msg.contains("mem#1"));
        assert!(msg.contains("mem#2"));
    }
}
