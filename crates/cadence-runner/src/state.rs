//! The task state channel.
//!
//! Besides stdin and stdout, every task gets two more pipes: its previous
//! state is readable on fd 3, and whatever it writes to fd 4 becomes its next
//! state. The caller decides whether to commit that output; cadence only does
//! so when the task exits 0.

use tokio::io::AsyncRead;

/// Descriptor the task reads its previous state from.
pub const STATE_IN_FD: i32 = 3;
/// Descriptor the task writes its next state to.
pub const STATE_OUT_FD: i32 = 4;
/// Largest state a task may write. Anything larger is discarded, not committed.
pub const MAX_STATE_BYTES: usize = 1024 * 1024;

pub(crate) type StateReader = Box<dyn AsyncRead + Send + Unpin>;

#[cfg(unix)]
pub(crate) use unix::StatePipes;

#[cfg(not(unix))]
pub(crate) use unsupported::StatePipes;

#[cfg(unix)]
mod unix {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    use tokio::io::AsyncWriteExt;
    use tokio::net::unix::pipe;
    use tokio::process::Command;
    use tracing::debug;

    use super::{StateReader, STATE_IN_FD, STATE_OUT_FD};

    /// Parent-side pipe ends live at or above this descriptor, so they can
    /// never be clobbered by the `dup2` onto 3 and 4 in the child.
    const MIN_PARENT_FD: RawFd = 10;

    /// Both state pipes of one process, before and during spawn.
    pub(crate) struct StatePipes {
        /// Read end, becomes fd 3 in the child.
        child_in: OwnedFd,
        /// Write end, becomes fd 4 in the child.
        child_out: OwnedFd,
        /// We write the previous state here.
        feed: OwnedFd,
        /// We read the next state from here.
        drain: OwnedFd,
    }

    impl StatePipes {
        pub(crate) fn open() -> io::Result<Self> {
            let (child_in, feed) = pipe_pair()?;
            let (drain, child_out) = pipe_pair()?;
            Ok(Self {
                child_in,
                child_out,
                feed,
                drain,
            })
        }

        /// Make the child ends appear as fd 3 and 4 in the spawned process.
        pub(crate) fn install(&self, command: &mut Command) {
            let read = self.child_in.as_raw_fd();
            let write = self.child_out.as_raw_fd();
            // Safety: the hook runs between fork and exec and only calls
            // dup2, which is async-signal-safe. dup2 clears close-on-exec on
            // the new descriptor, so 3 and 4 survive exec and the originals
            // do not.
            unsafe {
                command.pre_exec(move || {
                    if libc::dup2(read, STATE_IN_FD) < 0 || libc::dup2(write, STATE_OUT_FD) < 0 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        /// Call once the child is spawned. Closes our copies of the child
        /// ends, feeds `previous` to fd 3 and returns the reader for fd 4.
        pub(crate) fn start(self, previous: Vec<u8>) -> io::Result<StateReader> {
            let Self {
                child_in,
                child_out,
                feed,
                drain,
            } = self;
            drop(child_in);
            drop(child_out);

            let mut sender = pipe::Sender::from_owned_fd(feed)?;
            let receiver = pipe::Receiver::from_owned_fd(drain)?;
            tokio::spawn(async move {
                if let Err(e) = sender.write_all(&previous).await {
                    debug!(error = %e, "state input closed before it was fully written");
                }
            });
            Ok(Box::new(receiver))
        }
    }

    /// A close-on-exec pipe as `(read, write)`, both above `MIN_PARENT_FD`.
    fn pipe_pair() -> io::Result<(OwnedFd, OwnedFd)> {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        // Safety: `fds` has room for the two descriptors the call writes.
        #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        // Safety: as above.
        #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: both descriptors were just created and nothing else owns them.
        let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
        Ok((raise(read)?, raise(write)?))
    }

    /// Move `fd` to a close-on-exec descriptor numbered `MIN_PARENT_FD` or more.
    fn raise(fd: OwnedFd) -> io::Result<OwnedFd> {
        // Safety: `fd` is valid for the duration of the call.
        let raised = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, MIN_PARENT_FD) };
        if raised < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: F_DUPFD_CLOEXEC returned a fresh descriptor owned by us.
        Ok(unsafe { OwnedFd::from_raw_fd(raised) })
    }
}

#[cfg(not(unix))]
mod unsupported {
    use std::io;

    use tokio::process::Command;

    use super::StateReader;

    pub(crate) struct StatePipes;

    impl StatePipes {
        pub(crate) fn open() -> io::Result<Self> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "state channel needs unix"))
        }

        pub(crate) fn install(&self, _command: &mut Command) {}

        pub(crate) fn start(self, _previous: Vec<u8>) -> io::Result<StateReader> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "state channel needs unix"))
        }
    }
}

