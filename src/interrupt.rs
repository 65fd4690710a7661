//! Cooperative cancellation and pause for blocking I/O loops.
//!
//! An [`Interrupter`] is cloned into whoever needs to control a session (a
//! signal handler, a UI) and passed by reference into every loop that reads or
//! writes file content. Loops call [`Interrupter::checkpoint`] once per buffer.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::error::{io_err, PatchError, Result};

/// Buffer size for every interruptible copy loop.
pub const COPY_BUFFER_SIZE: usize = 256 * 1024;

type Cleanup = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    paused: Mutex<bool>,
    resumed: Condvar,
    next_cleanup_id: AtomicU64,
    cleanups: Mutex<Vec<(u64, Cleanup)>>,
}

/// Shared cancel/pause switch.
#[derive(Clone, Default)]
pub struct Interrupter {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupter")
            .field("cancelled", &self.is_cancelled())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl Interrupter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Also wakes a paused worker so it can observe it.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        let _guard = self.lock_paused();
        self.inner.resumed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        let mut guard = self.lock_paused();
        *guard = paused;
        if !paused {
            self.inner.resumed.notify_all();
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.lock_paused()
    }

    /// Block while paused, then fail with [`PatchError::Cancelled`] if a
    /// cancellation was requested. Registered cleanups run exactly once, before
    /// the error is returned.
    pub fn checkpoint(&self) -> Result<()> {
        {
            let mut paused = self.lock_paused();
            while *paused && !self.is_cancelled() {
                paused = self
                    .inner
                    .resumed
                    .wait(paused)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        }
        if self.is_cancelled() {
            self.run_cleanups();
            return Err(PatchError::Cancelled);
        }
        Ok(())
    }

    /// Register a callback to run if the session is cancelled while the
    /// returned guard is alive. Dropping the guard unregisters it.
    pub fn on_cancel<F>(&self, cleanup: F) -> CleanupGuard
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_cleanup_id.fetch_add(1, Ordering::Relaxed);
        self.lock_cleanups().push((id, Box::new(cleanup)));
        CleanupGuard {
            id,
            owner: self.clone(),
        }
    }

    fn run_cleanups(&self) {
        let pending: Vec<(u64, Cleanup)> = std::mem::take(&mut *self.lock_cleanups());
        for (_, cleanup) in pending.into_iter().rev() {
            cleanup();
        }
    }

    fn lock_paused(&self) -> MutexGuard<'_, bool> {
        self.inner
            .paused
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_cleanups(&self) -> MutexGuard<'_, Vec<(u64, Cleanup)>> {
        self.inner
            .cleanups
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Keeps a cancellation cleanup registered.
#[must_use = "the cleanup is unregistered as soon as the guard is dropped"]
pub struct CleanupGuard {
    id: u64,
    owner: Interrupter,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.owner.lock_cleanups().retain(|(id, _)| *id != self.id);
    }
}

/// Copy exactly `len` bytes from `reader` to `writer`, checking the
/// interrupter between buffers. `source` and `dest` only annotate errors.
pub fn copy_exact<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    len: u64,
    interrupter: &Interrupter,
    source: &Path,
    dest: &Path,
) -> Result<()> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE.min(len.max(1) as usize)];
    let mut remaining = len;
    while remaining > 0 {
        interrupter.checkpoint()?;
        let want = buf.len().min(remaining as usize);
        let n = reader.read(&mut buf[..want]).map_err(|e| io_err(source, e))?;
        if n == 0 {
            return Err(PatchError::format(format!(
                "{} ended {remaining} bytes early",
                source.display()
            )));
        }
        writer.write_all(&buf[..n]).map_err(|e| io_err(dest, e))?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Copy `reader` to `writer` until end of input. Returns the byte count.
pub fn copy_to_end<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    interrupter: &Interrupter,
    source: &Path,
    dest: &Path,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        interrupter.checkpoint()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_err(source, e)),
        };
        writer.write_all(&buf[..n]).map_err(|e| io_err(dest, e))?;
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_checkpoint_passes_when_idle() {
        let interrupter = Interrupter::new();
        assert!(interrupter.checkpoint().is_ok());
    }

    #[test]
    fn test_cancel_runs_registered_cleanups_once() {
        let interrupter = Interrupter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let _guard = interrupter.on_cancel(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        interrupter.cancel();
        assert!(matches!(interrupter.checkpoint(), Err(PatchError::Cancelled)));
        assert!(matches!(interrupter.checkpoint(), Err(PatchError::Cancelled)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_guard_unregisters_cleanup() {
        let interrupter = Interrupter::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        drop(interrupter.on_cancel(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        interrupter.cancel();
        assert!(interrupter.checkpoint().is_err());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pause_blocks_until_resumed() {
        let interrupter = Interrupter::new();
        interrupter.set_paused(true);

        let worker = {
            let interrupter = interrupter.clone();
            std::thread::spawn(move || interrupter.checkpoint().is_ok())
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!worker.is_finished());

        interrupter.set_paused(false);
        assert!(worker.join().unwrap());
    }

    #[test]
    fn test_cancel_wakes_paused_worker() {
        let interrupter = Interrupter::new();
        interrupter.set_paused(true);

        let worker = {
            let interrupter = interrupter.clone();
            std::thread::spawn(move || interrupter.checkpoint())
        };
        std::thread::sleep(Duration::from_millis(20));
        interrupter.cancel();
        assert!(matches!(worker.join().unwrap(), Err(PatchError::Cancelled)));
    }

    #[test]
    fn test_copy_exact_detects_short_input() {
        let interrupter = Interrupter::new();
        let mut src: &[u8] = b"abc";
        let mut out = Vec::new();
        let err = copy_exact(
            &mut src,
            &mut out,
            5,
            &interrupter,
            Path::new("src"),
            Path::new("dst"),
        )
        .unwrap_err();
        assert!(matches!(err, PatchError::Format { .. }));
    }

    #[test]
    fn test_copy_to_end_counts_bytes() {
        let interrupter = Interrupter::new();
        let data = vec![7u8; COPY_BUFFER_SIZE + 10];
        let mut src: &[u8] = &data;
        let mut out = Vec::new();
        let n = copy_to_end(&mut src, &mut out, &interrupter, Path::new("a"), Path::new("b"))
            .unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
    }
}
