//! Single-byte exit-status file that doubles as the instance lock.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::debug;

use crate::error::LedgerError;

type Result<T> = std::result::Result<T, LedgerError>;

enum Handle {
    Unlocked(File),
    Locked(Flock<File>),
}

impl Handle {
    fn file(&mut self) -> &mut File {
        match self {
            Handle::Unlocked(f) => f,
            Handle::Locked(f) => &mut **f,
        }
    }
}

/// Open ledger. The lock, once taken, is held until drop.
pub struct Ledger {
    handle: Handle,
    path: PathBuf,
}

/// Outcome of [`Ledger::open_or_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opened {
    /// Status left by the previous run, or the initial value just written.
    pub previous: u8,
    /// The file did not exist before this call.
    pub created: bool,
}

impl Ledger {
    /// Create `path` exclusively (mode 0600) and write `initial`, or open the
    /// existing file and read its status byte.
    pub fn open_or_create(path: &Path, initial: u8) -> Result<(Self, Opened)> {
        let created = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path);

        match created {
            Ok(file) => {
                let mut ledger = Self::new(file, path);
                ledger.write(initial)?;
                debug!(path = %path.display(), status = initial, "created ledger");
                Ok((
                    ledger,
                    Opened {
                        previous: initial,
                        created: true,
                    },
                ))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(|source| io_err("open", path, source))?;
                let mut ledger = Self::new(file, path);
                let previous = ledger.read()?;
                Ok((
                    ledger,
                    Opened {
                        previous,
                        created: false,
                    },
                ))
            }
            Err(source) => Err(io_err("open", path, source)),
        }
    }

    fn new(file: File, path: &Path) -> Self {
        Self {
            handle: Handle::Unlocked(file),
            path: path.to_path_buf(),
        }
    }

    /// Take the exclusive advisory lock without blocking.
    ///
    /// Fails with [`LedgerError::Locked`] if another instance holds it.
    pub fn lock(self) -> Result<Self> {
        let Ledger { handle, path } = self;
        let file = match handle {
            Handle::Locked(_) => return Ok(Ledger { handle, path }),
            Handle::Unlocked(file) => file,
        };

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => Ok(Ledger {
                handle: Handle::Locked(locked),
                path,
            }),
            Err((_, Errno::EWOULDBLOCK)) => Err(LedgerError::Locked { path }),
            Err((_, errno)) => Err(io_err("flock", &path, errno.into())),
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self.handle, Handle::Locked(_))
    }

    /// Read the status byte from offset 0.
    pub fn read(&mut self) -> Result<u8> {
        let file = self.handle.file();
        file.seek(SeekFrom::Start(0))
            .map_err(|source| io_err("seek", &self.path, source))?;

        let mut buf = [0u8; 1];
        let n = file
            .read(&mut buf)
            .map_err(|source| io_err("read", &self.path, source))?;
        if n != 1 {
            return Err(LedgerError::Empty {
                path: self.path.clone(),
            });
        }
        Ok(buf[0])
    }

    /// Overwrite the status byte with a single write at offset 0.
    pub fn write(&mut self, status: u8) -> Result<()> {
        let file = self.handle.file();
        file.seek(SeekFrom::Start(0))
            .map_err(|source| io_err("seek", &self.path, source))?;

        let n = file
            .write(&[status])
            .map_err(|source| io_err("write", &self.path, source))?;
        if n != 1 {
            return Err(io_err(
                "write",
                &self.path,
                std::io::Error::from(ErrorKind::WriteZero),
            ));
        }
        Ok(())
    }

    /// Write an exit code, saturating values outside `0..=255`.
    pub fn write_code(&mut self, code: i32) -> Result<()> {
        self.write(code.clamp(0, 255) as u8)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn io_err(op: &'static str, path: &Path, source: std::io::Error) -> LedgerError {
    LedgerError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}
