//! The three pipes between the engine and its child.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd::{close, dup2, pipe};
use tether_pump::RingBuffer;
use tracing::debug;

use crate::error::ProcError;

const SCRATCH_SIZE: usize = 4096;
/// 16 x 4 KiB, the default Linux pipe buffer.
const DISCARD_READS: usize = 16;

/// Stdin, stdout and stderr pipes for one child.
///
/// Created before fork. The child half is consumed by
/// [`prepare_child`](Self::prepare_child) in the forked process; the parent
/// then calls [`prepare_parent`](Self::prepare_parent) to drop its copies of
/// the child ends. All descriptors are close-on-exec and above the standard
/// descriptor range.
#[derive(Debug)]
pub struct PipeSet {
    stdin_read: Option<OwnedFd>,
    stdin_write: Option<File>,
    stdout_read: File,
    stdout_write: Option<OwnedFd>,
    stderr_read: File,
    stderr_write: Option<OwnedFd>,
    stdout_eof: bool,
    stderr_eof: bool,
}

impl PipeSet {
    pub fn new() -> Result<Self, ProcError> {
        let (stdin_read, stdin_write) = open_pipe("stdin pipe")?;
        let (stdout_read, stdout_write) = open_pipe("stdout pipe")?;
        let (stderr_read, stderr_write) = open_pipe("stderr pipe")?;

        let stdout_read = File::from(stdout_read);
        let stderr_read = File::from(stderr_read);
        set_nonblocking(stdout_read.as_raw_fd())?;
        set_nonblocking(stderr_read.as_raw_fd())?;

        Ok(Self {
            stdin_read: Some(stdin_read),
            stdin_write: Some(File::from(stdin_write)),
            stdout_read,
            stdout_write: Some(stdout_write),
            stderr_read,
            stderr_write: Some(stderr_write),
            stdout_eof: false,
            stderr_eof: false,
        })
    }

    /// Wire the child ends onto descriptors 0, 1 and 2 and close every
    /// source descriptor. Runs in the forked child: no allocation, no locks.
    pub(crate) fn prepare_child(&self) -> nix::Result<()> {
        let (Some(stdin_read), Some(stdout_write), Some(stderr_write)) = (
            self.stdin_read.as_ref(),
            self.stdout_write.as_ref(),
            self.stderr_write.as_ref(),
        ) else {
            return Err(Errno::EBADF);
        };

        dup2(stdin_read.as_raw_fd(), libc::STDIN_FILENO)?;
        dup2(stdout_write.as_raw_fd(), libc::STDOUT_FILENO)?;
        dup2(stderr_write.as_raw_fd(), libc::STDERR_FILENO)?;

        let sources = [
            stdin_read.as_raw_fd(),
            stdout_write.as_raw_fd(),
            stderr_write.as_raw_fd(),
            self.stdout_read.as_raw_fd(),
            self.stderr_read.as_raw_fd(),
            self.stdin_write.as_ref().map_or(-1, |f| f.as_raw_fd()),
        ];
        for fd in sources {
            if fd > libc::STDERR_FILENO {
                let _ = close(fd);
            }
        }
        Ok(())
    }

    /// Close the parent's copies of the child ends so EOF propagates.
    pub fn prepare_parent(&mut self) {
        self.stdin_read = None;
        self.stdout_write = None;
        self.stderr_write = None;
    }

    /// Move whatever stdout has ready into `ring`. Returns true if any bytes
    /// were read.
    pub fn drain_stdout(&mut self, ring: &mut RingBuffer) -> Result<bool, ProcError> {
        drain(&mut self.stdout_read, &mut self.stdout_eof, ring)
    }

    pub fn drain_stderr(&mut self, ring: &mut RingBuffer) -> Result<bool, ProcError> {
        drain(&mut self.stderr_read, &mut self.stderr_eof, ring)
    }

    /// True once both output pipes have reported end of stream, i.e. every
    /// writer (the child and anything it forked) has closed them.
    pub fn output_closed(&self) -> bool {
        self.stdout_eof && self.stderr_eof
    }

    /// Copy everything from `source` to the child's stdin, then close it.
    ///
    /// A child that exits without reading everything is not an error; the
    /// remaining input is dropped.
    pub fn feed_stdin<R: Read + ?Sized>(&mut self, source: &mut R) -> Result<usize, ProcError> {
        let Some(stdin) = self.stdin_write.as_mut() else {
            return Ok(0);
        };

        let mut buffer = [0u8; SCRATCH_SIZE];
        let mut total = 0;
        loop {
            let n = match source.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            match stdin.write_all(&buffer[..n]) {
                Ok(()) => total += n,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!(written = total, "child closed stdin early");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.close_stdin();
        Ok(total)
    }

    /// Write `data` to the child's stdin, leaving it open.
    pub fn write_stdin(&mut self, data: &[u8]) -> Result<usize, ProcError> {
        let Some(stdin) = self.stdin_write.as_mut() else {
            return Ok(0);
        };
        match stdin.write_all(data) {
            Ok(()) => Ok(data.len()),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Write as much of `data` as the pipe takes without blocking. Call
    /// [`set_stdin_nonblocking`](Self::set_stdin_nonblocking) first.
    ///
    /// A child that closed its stdin ends the feed: stdin is closed here and
    /// 0 is returned from then on.
    pub fn offer_stdin(&mut self, data: &[u8]) -> Result<usize, ProcError> {
        let Some(stdin) = self.stdin_write.as_mut() else {
            return Ok(0);
        };
        if data.is_empty() {
            return Ok(0);
        }
        match stdin.write(data) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(0)
            }
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("child closed stdin early");
                self.close_stdin();
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn set_stdin_nonblocking(&mut self) -> Result<(), ProcError> {
        match self.stdin_write.as_ref() {
            Some(stdin) => set_nonblocking(stdin.as_raw_fd()),
            None => Ok(()),
        }
    }

    /// Idempotent.
    pub fn close_stdin(&mut self) {
        if self.stdin_write.take().is_some() {
            debug!("closed child stdin");
        }
    }

    pub fn stdin_open(&self) -> bool {
        self.stdin_write.is_some()
    }
}

fn drain(pipe: &mut File, eof: &mut bool, ring: &mut RingBuffer) -> Result<bool, ProcError> {
    if *eof {
        return Ok(false);
    }
    let mut source = EofWatch { inner: pipe, eof };
    if ring.capacity() == 0 {
        return discard(&mut source);
    }
    Ok(ring.write_from(&mut source)? > 0)
}

/// Zero-capacity rings still drain the pipe so the child never blocks on it.
/// Reads at most one pipe buffer's worth per call.
fn discard(pipe: &mut impl Read) -> Result<bool, ProcError> {
    let mut scratch = [0u8; SCRATCH_SIZE];
    let mut any = false;
    for _ in 0..DISCARD_READS {
        match pipe.read(&mut scratch) {
            Ok(0) => break,
            Ok(_) => any = true,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                break;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(any)
}

/// Records a zero-length read into a non-empty buffer, which on a pipe means
/// every write end is closed.
struct EofWatch<'a> {
    inner: &'a mut File,
    eof: &'a mut bool,
}

impl Read for EofWatch<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            *self.eof = true;
        }
        Ok(n)
    }
}

fn open_pipe(context: &'static str) -> Result<(OwnedFd, OwnedFd), ProcError> {
    let (read, write) = pipe().map_err(|source| ProcError::Ipc { context, source })?;
    let read = lift_above_stdio(read)?;
    let write = lift_above_stdio(write)?;
    set_cloexec(read.as_raw_fd()).map_err(|source| ProcError::Ipc { context, source })?;
    set_cloexec(write.as_raw_fd()).map_err(|source| ProcError::Ipc { context, source })?;
    Ok((read, write))
}

/// A pipe end that landed on 0, 1 or 2 (because the parent runs with a
/// closed standard descriptor) would be clobbered by the child's `dup2`.
fn lift_above_stdio(fd: OwnedFd) -> io::Result<OwnedFd> {
    let mut low = Vec::new();
    let mut fd = fd;
    while fd.as_raw_fd() <= libc::STDERR_FILENO {
        let next = fd.try_clone()?;
        low.push(fd);
        fd = next;
    }
    Ok(fd)
}

fn set_cloexec(fd: RawFd) -> nix::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFD)?;
    let mut flags = FdFlag::from_bits_truncate(flags);
    flags.insert(FdFlag::FD_CLOEXEC);
    fcntl(fd, FcntlArg::F_SETFD(flags))?;
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> Result<(), ProcError> {
    let to_ipc = |source| ProcError::Ipc {
        context: "pipe flags",
        source,
    };
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(to_ipc)?;
    let mut flags = OFlag::from_bits_truncate(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(to_ipc)?;
    Ok(())
}
