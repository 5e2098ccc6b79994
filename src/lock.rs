use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("cannot lock {path:?}: {source}")]
pub struct LockError {
    path: PathBuf,
    #[source]
    source: io::Error,
}

/// Exclusive advisory lock serializing invocations that change the rule set.
/// Released on drop.
#[derive(Debug)]
pub struct Lock {
    _file: Flock<File>,
}

impl Lock {
    /// Blocks until the lock at `path` is held.
    pub async fn acquire(path: &Path) -> Result<Self, LockError> {
        let path = path.to_owned();

        let result = tokio::task::spawn_blocking({
            let path = path.clone();
            move || -> io::Result<Flock<File>> {
                let file = OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(&path)?;

                Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, e)| io::Error::from(e))
            }
        })
        .await
        .unwrap_or_else(|e| Err(io::Error::other(e)));

        match result {
            Ok(file) => {
                trace!("locked {}", path.display());
                Ok(Self { _file: file })
            }
            Err(source) => Err(LockError { path, source }),
        }
    }
}
