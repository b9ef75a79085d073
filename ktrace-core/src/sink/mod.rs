//! ## ktrace-core::sink
//! **Write targets and the equivalence used to share them**
//!
//! Two handles share one descriptor when they resolve to the same
//! [`SinkIdentity`]: files compare by `(device, inode)`, so different paths or
//! duplicated handles to one file unify. Sinks without an inode identity get a
//! process-unique handle number and never unify with anything else.

use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

pub mod memory;

pub use memory::MemorySink;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Equivalence class of an underlying write target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SinkIdentity {
    Inode { dev: u64, ino: u64 },
    Handle(u64),
}

impl SinkIdentity {
    /// A fresh identity that compares equal to nothing allocated before it.
    pub fn unique() -> Self {
        SinkIdentity::Handle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SinkIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SinkIdentity::Inode { dev, ino } => write!(f, "inode:{dev}:{ino}"),
            SinkIdentity::Handle(id) => write!(f, "handle:{id}"),
        }
    }
}

/// A destination a trace stream is written to.
///
/// Only the sink's writer thread ever calls [`Write`] methods on it.
pub trait TraceSink: Write + Send + 'static {
    fn identity(&self) -> io::Result<SinkIdentity>;

    /// Interactive sinks (pipes, terminals, sockets) use the short wake-up delay.
    fn is_interactive(&self) -> bool {
        false
    }
}

impl TraceSink for Box<dyn TraceSink> {
    fn identity(&self) -> io::Result<SinkIdentity> {
        (**self).identity()
    }

    fn is_interactive(&self) -> bool {
        (**self).is_interactive()
    }
}

#[cfg(unix)]
impl TraceSink for File {
    fn identity(&self) -> io::Result<SinkIdentity> {
        use std::os::unix::fs::MetadataExt;

        let meta = self.metadata()?;
        Ok(SinkIdentity::Inode {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    fn is_interactive(&self) -> bool {
        use std::os::unix::fs::FileTypeExt;

        self.metadata()
            .map(|meta| {
                let ty = meta.file_type();
                ty.is_fifo() || ty.is_char_device() || ty.is_socket()
            })
            .unwrap_or(false)
    }
}

#[cfg(not(unix))]
impl TraceSink for File {
    fn identity(&self) -> io::Result<SinkIdentity> {
        Ok(SinkIdentity::unique())
    }
}

#[cfg(unix)]
impl TraceSink for std::os::unix::net::UnixStream {
    fn identity(&self) -> io::Result<SinkIdentity> {
        Ok(SinkIdentity::unique())
    }

    fn is_interactive(&self) -> bool {
        true
    }
}

impl TraceSink for std::process::ChildStdin {
    fn identity(&self) -> io::Result<SinkIdentity> {
        Ok(SinkIdentity::unique())
    }

    fn is_interactive(&self) -> bool {
        true
    }
}
