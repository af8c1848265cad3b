//! Bounded capture of a child's output streams

use parking_lot::Mutex;
use std::io::Read;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Default)]
struct Buffer {
    data: Vec<u8>,
    omitted: u64,
}

/// Output collected from one stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub data: Vec<u8>,
    pub truncated: bool,
}

/// A stream being drained on a background thread.
///
/// The reader keeps consuming past the limit so the child never blocks on a full pipe;
/// surplus bytes are counted and replaced by a marker.
#[derive(Debug)]
pub struct StreamCapture {
    name: &'static str,
    limit: usize,
    buffer: Arc<Mutex<Buffer>>,
    done: Receiver<()>,
}

impl StreamCapture {
    /// Start draining `source` into a buffer of at most `limit` bytes
    pub fn spawn<R>(name: &'static str, mut source: R, limit: usize) -> std::io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Buffer::default()));
        let (done_tx, done) = mpsc::channel();
        let shared = Arc::clone(&buffer);

        std::thread::Builder::new()
            .name(format!("bulkhead-{name}"))
            .spawn(move || {
                let mut chunk = vec![0u8; READ_CHUNK];
                loop {
                    let n = match source.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            tracing::warn!(stream = name, error = %e, "output read failed");
                            break;
                        }
                    };

                    let mut buf = shared.lock();
                    let room = limit.saturating_sub(buf.data.len());
                    let keep = n.min(room);
                    buf.data.extend_from_slice(&chunk[..keep]);
                    buf.omitted += (n - keep) as u64;
                }
                drop(done_tx.send(()));
            })?;

        Ok(Self {
            name,
            limit,
            buffer,
            done,
        })
    }

    /// Wait up to `drain_timeout` for the stream to close and return what was captured.
    ///
    /// A stream still open after the timeout (a descendant kept the pipe) yields the bytes
    /// read so far; the reader thread finishes on its own once the pipe closes.
    #[must_use]
    pub fn finish(self, drain_timeout: Duration) -> CapturedOutput {
        match self.done.recv_timeout(drain_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                tracing::warn!(
                    stream = self.name,
                    timeout_ms = drain_timeout.as_millis(),
                    "output stream still open after drain timeout, returning partial output"
                );
            }
        }

        let mut buf = self.buffer.lock();
        let mut data = std::mem::take(&mut buf.data);
        let omitted = buf.omitted;
        drop(buf);

        if omitted > 0 {
            tracing::debug!(stream = self.name, limit = self.limit, omitted, "output truncated");
            data.extend_from_slice(truncation_marker(omitted).as_bytes());
        }

        CapturedOutput {
            data,
            truncated: omitted > 0,
        }
    }
}

fn truncation_marker(omitted: u64) -> String {
    format!("\n[bulkhead: output truncated, {omitted} bytes omitted]\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn keeps_everything_under_the_limit() {
        let capture = StreamCapture::spawn("stdout", Cursor::new(b"hello".to_vec()), 1024).unwrap();
        let out = capture.finish(Duration::from_secs(5));
        assert_eq!(out.data, b"hello");
        assert!(!out.truncated);
    }

    #[test]
    fn truncates_with_marker_past_the_limit() {
        let input = vec![b'x'; 200_000];
        let capture = StreamCapture::spawn("stderr", Cursor::new(input), 100).unwrap();
        let out = capture.finish(Duration::from_secs(5));

        assert!(out.truncated);
        assert!(out.data.starts_with(&[b'x'; 100]));
        let tail = String::from_utf8_lossy(&out.data[100..]).into_owned();
        assert!(tail.contains("199900 bytes omitted"), "{tail}");
    }

    #[test]
    fn returns_partial_output_when_the_writer_stays_open() {
        let (reader, mut writer) = crate::pipe::create_pipe().unwrap();
        std::io::Write::write_all(&mut writer, b"partial").unwrap();

        let capture = StreamCapture::spawn("stdout", reader, 1024).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let out = capture.finish(Duration::from_millis(50));
        assert_eq!(out.data, b"partial");
        drop(writer);
    }
}
