use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use skiff_crypto::hashing::StreamingHasher;

use crate::cancel::CancelSet;

/// How long to sleep at a time while pacing, so cancellation is noticed.
const PACE_SLICE: Duration = Duration::from_millis(100);

fn cancelled_error() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "transfer cancelled")
}

/// Pace I/O so the cumulative rate stays at or below `limit_bps`.
/// Shared by the reader and writer wrappers.
struct Pacer {
    limit_bps: u64,
    started: Instant,
    transferred: u64,
    cancel: CancelSet,
}

impl Pacer {
    fn new(limit_bps: u64, cancel: CancelSet) -> Self {
        Self {
            limit_bps,
            started: Instant::now(),
            transferred: 0,
            cancel,
        }
    }

    fn account(&mut self, bytes: usize) -> io::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(cancelled_error());
        }
        self.transferred += bytes as u64;
        if self.limit_bps == 0 {
            return Ok(());
        }
        // Sleep until wall time catches up with the amount transferred.
        let due = Duration::from_secs_f64(self.transferred as f64 / self.limit_bps as f64);
        while self.started.elapsed() < due {
            if self.cancel.wait_timeout(PACE_SLICE) {
                return Err(cancelled_error());
            }
        }
        Ok(())
    }
}

/// Rate-limits and cancellation-checks an underlying reader.
pub struct ThrottledReader<R> {
    inner: R,
    pacer: Pacer,
}

impl<R: Read> ThrottledReader<R> {
    pub fn new(inner: R, limit_bps: u64, cancel: impl Into<CancelSet>) -> Self {
        Self {
            inner,
            pacer: Pacer::new(limit_bps, cancel.into()),
        }
    }
}

impl<R: Read> Read for ThrottledReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.pacer.account(n)?;
        Ok(n)
    }
}

/// Rate-limits and cancellation-checks an underlying writer.
pub struct ThrottledWriter<W> {
    inner: W,
    pacer: Pacer,
}

impl<W: Write> ThrottledWriter<W> {
    pub fn new(inner: W, limit_bps: u64, cancel: impl Into<CancelSet>) -> Self {
        Self {
            inner,
            pacer: Pacer::new(limit_bps, cancel.into()),
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ThrottledWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.pacer.account(n)?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reports cumulative bytes read to a callback.
pub struct ProgressReader<R, F: FnMut(u64)> {
    inner: R,
    bytes: u64,
    report: F,
}

impl<R: Read, F: FnMut(u64)> ProgressReader<R, F> {
    pub fn new(inner: R, report: F) -> Self {
        Self {
            inner,
            bytes: 0,
            report,
        }
    }
}

impl<R: Read, F: FnMut(u64)> Read for ProgressReader<R, F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.bytes += n as u64;
            (self.report)(self.bytes);
        }
        Ok(n)
    }
}

/// Reports cumulative bytes written to a callback.
pub struct ProgressWriter<W, F: FnMut(u64)> {
    inner: W,
    bytes: u64,
    report: F,
}

impl<W: Write, F: FnMut(u64)> ProgressWriter<W, F> {
    pub fn new(inner: W, report: F) -> Self {
        Self {
            inner,
            bytes: 0,
            report,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write, F: FnMut(u64)> Write for ProgressWriter<W, F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if n > 0 {
            self.bytes += n as u64;
            (self.report)(self.bytes);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hashes and counts everything written through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Option<Box<dyn StreamingHasher>>,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W, hasher: Box<dyn StreamingHasher>) -> Self {
        Self {
            inner,
            hasher: Some(hasher),
            bytes: 0,
        }
    }

    /// Final digest and total byte count. Call after the last write.
    pub fn finish(mut self) -> (String, u64, W) {
        let hasher = self.hasher.take().expect("finish called once");
        (hasher.finalize_base64(), self.bytes, self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if n > 0 {
            if let Some(hasher) = self.hasher.as_mut() {
                hasher.update(&buf[..n]);
            }
            self.bytes += n as u64;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use skiff_crypto::hashing::hasher_for;

    #[test]
    fn progress_reader_reports_cumulative_bytes() {
        let data = vec![7u8; 1000];
        let mut seen = Vec::new();
        let mut reader = ProgressReader::new(&data[..], |b| seen.push(b));
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 1000);
        assert_eq!(*seen.last().unwrap(), 1000);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn throttle_paces_reads() {
        // 2000 bytes at 10 KiB/s should take at least ~150 ms.
        let data = vec![0u8; 2000];
        let mut reader = ThrottledReader::new(&data[..], 10_240, CancelToken::new());
        let start = Instant::now();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(150));
    }

    #[test]
    fn cancelled_token_interrupts_io() {
        let token = CancelToken::new();
        token.cancel();
        let data = vec![0u8; 16];
        let mut reader = ThrottledReader::new(&data[..], 0, token);
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }

    #[test]
    fn hashing_writer_matches_file_hash() {
        let mut writer = HashingWriter::new(Vec::new(), hasher_for("sha256").unwrap());
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        let (digest, bytes, inner) = writer.finish();
        assert_eq!(bytes, 11);
        assert_eq!(inner, b"hello world");

        let mut reference = hasher_for("sha256").unwrap();
        reference.update(b"hello world");
        assert_eq!(digest, reference.finalize_base64());
    }
}
