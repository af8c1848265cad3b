//! Pipes between the supervisor and the sandbox child

use crate::protocol::{self, ChildReport};
use crate::{Result, SandboxError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

/// Largest report frame accepted from a child
const MAX_REPORT_LEN: usize = 64 * 1024;

/// Create a pipe (returns read end, write end), both close-on-exec
pub fn create_pipe() -> Result<(File, File)> {
    let mut fds = [0i32; 2];

    // SAFETY: pipe2 syscall
    let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };

    if ret != 0 {
        return Err(SandboxError::Io(std::io::Error::last_os_error()));
    }

    // SAFETY: We just created these file descriptors
    let read_end = unsafe { File::from_raw_fd(fds[0]) };
    let write_end = unsafe { File::from_raw_fd(fds[1]) };

    Ok((read_end, write_end))
}

/// Supervisor end of a report channel carrying `T` frames
#[derive(Debug)]
pub struct ReportReader<T = ChildReport> {
    rx: File,
    _frame: PhantomData<fn() -> T>,
}

/// Child end of a report channel carrying `T` frames
#[derive(Debug)]
pub struct ReportWriter<T = ChildReport> {
    tx: File,
    _frame: PhantomData<fn(&T)>,
}

/// Create a report channel
pub fn report_channel<T>() -> Result<(ReportReader<T>, ReportWriter<T>)> {
    let (rx, tx) = create_pipe()?;
    Ok((
        ReportReader {
            rx,
            _frame: PhantomData,
        },
        ReportWriter {
            tx,
            _frame: PhantomData,
        },
    ))
}

impl<T: DeserializeOwned> ReportReader<T> {
    /// Wait up to `timeout` for a frame or for the write end to close.
    ///
    /// Returns `true` once [`Self::recv`] will not block.
    pub fn poll(&self, timeout: Duration) -> Result<bool> {
        let mut fds = [libc::pollfd {
            fd: self.rx.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);

        // SAFETY: poll on one valid descriptor
        let ret = unsafe { libc::poll(fds.as_mut_ptr(), 1, timeout_ms) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(SandboxError::Io(err));
        }
        Ok(ret > 0 && fds[0].revents != 0)
    }

    /// Block until the child either sends a frame or closes the pipe.
    ///
    /// `Ok(None)` means every copy of the write end was closed without a frame. On the
    /// setup channel that means the action's program is running.
    pub fn recv(&mut self) -> Result<Option<T>> {
        // Read length prefix
        let mut len_bytes = [0u8; 4];
        match read_full(&mut self.rx, &mut len_bytes)? {
            0 => return Ok(None),
            4 => {}
            n => {
                return Err(SandboxError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("truncated report header ({n} bytes)"),
                )));
            }
        }

        let len = u32::from_be_bytes(len_bytes) as usize;

        if len > MAX_REPORT_LEN {
            return Err(SandboxError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("report too large: {len} bytes"),
            )));
        }

        let mut frame = vec![0u8; len];
        self.rx.read_exact(&mut frame)?;

        let report = protocol::decode(&frame).map_err(|e| {
            SandboxError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("failed to decode child report: {e}"),
            ))
        })?;
        Ok(Some(report))
    }
}

impl<T: Serialize> ReportWriter<T> {
    /// Send a frame to the supervisor
    pub fn send(&mut self, report: &T) -> Result<()> {
        let frame = protocol::encode(report).map_err(|e| {
            SandboxError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        })?;

        // Send length prefix
        let len_bytes = u32::try_from(frame.len())
            .map_err(|_| {
                SandboxError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "report too large",
                ))
            })?
            .to_be_bytes();
        self.tx.write_all(&len_bytes)?;

        // Send report
        self.tx.write_all(&frame)?;

        Ok(())
    }
}

impl<T> ReportWriter<T> {
    /// Raw descriptor, for closing the inherited copy after a fork
    pub fn as_raw_fd(&self) -> RawFd {
        self.tx.as_raw_fd()
    }
}

/// Read until `buf` is full or EOF; returns the number of bytes read
fn read_full(src: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(SandboxError::Io(e)),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Stage;
    use crate::protocol::ActionStatus;
    use nix::errno::Errno;

    #[test]
    fn closed_pipe_without_report_means_running() {
        let (mut reader, writer) = report_channel::<ChildReport>().unwrap();
        drop(writer);
        assert!(reader.recv().unwrap().is_none());
    }

    #[test]
    fn poll_waits_for_the_writer() {
        let (reader, writer) = report_channel::<ChildReport>().unwrap();
        assert!(!reader.poll(Duration::from_millis(20)).unwrap());
        drop(writer);
        assert!(reader.poll(Duration::from_millis(20)).unwrap());
    }

    #[test]
    fn action_status_frame_is_delivered() {
        let (mut reader, mut writer) = report_channel::<ActionStatus>().unwrap();
        let status = ActionStatus::signaled(libc::SIGINT);
        writer.send(&status).unwrap();
        drop(writer);
        assert!(reader.poll(Duration::ZERO).unwrap());
        assert_eq!(reader.recv().unwrap(), Some(status));
        assert_eq!(reader.recv().unwrap(), None);
    }

    #[test]
    fn report_frame_is_delivered() {
        let (mut reader, mut writer) = report_channel::<ChildReport>().unwrap();
        let report = ChildReport::setup_failed(Stage::RootPivoted, Errno::EACCES, "pivot_root");
        writer.send(&report).unwrap();
        drop(writer);
        assert_eq!(reader.recv().unwrap(), Some(report));
    }
}
