//! Interrupt-safe diagnostic line buffer.
//!
//! The bit interrupt cannot print: formatting into a blocking sink would
//! blow the per-bit time budget. Instead it pushes complete text lines into
//! a lock-free single-producer single-consumer ring, and the foreground
//! loop drains them at leisure.
//!
//! When the ring is full the *oldest* line is dropped so the most recent
//! diagnostics survive; drops are counted.
//!
//! # Example
//!
//! ```rust
//! use rs_dcc::trace::TraceBuf;
//!
//! let buf: TraceBuf<8> = TraceBuf::new();
//! buf.push_args(format_args!(">> speed={}", 8));
//! let line = buf.drain().unwrap();
//! assert_eq!(line.as_str(), ">> speed=8");
//! ```

use core::cell::UnsafeCell;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

/// Maximum line length in bytes; longer lines are truncated.
pub const LINE_LEN: usize = 96;

/// Default ring used by the station.
pub type StationTrace = TraceBuf<64>;

/// One diagnostic line.
#[derive(Clone, Copy)]
pub struct TraceLine {
    len: u8,
    buf: [u8; LINE_LEN],
}

impl TraceLine {
    const fn empty() -> Self {
        TraceLine {
            len: 0,
            buf: [0; LINE_LEN],
        }
    }

    /// The line text.
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.buf[..self.len as usize]).unwrap_or("")
    }
}

impl fmt::Debug for TraceLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TraceLine").field(&self.as_str()).finish()
    }
}

/// Lock-free SPSC ring of diagnostic lines.
///
/// Producer is the bit interrupt, consumer is the foreground loop. `N`
/// must be a power of two.
pub struct TraceBuf<const N: usize> {
    lines: UnsafeCell<[TraceLine; N]>,
    write_idx: AtomicU32,
    read_idx: AtomicU32,
    dropped: AtomicU32,
}

// SAFETY: one producer, one consumer; index claims go through the atomics
// with release/acquire ordering, and an overwritten slot is only read by a
// consumer whose claim CAS then fails, discarding the copy.
unsafe impl<const N: usize> Sync for TraceBuf<N> {}
unsafe impl<const N: usize> Send for TraceBuf<N> {}

impl<const N: usize> TraceBuf<N> {
    const MASK: u32 = (N as u32) - 1;

    /// Create an empty ring.
    pub const fn new() -> Self {
        assert!(N.is_power_of_two());
        TraceBuf {
            lines: UnsafeCell::new([TraceLine::empty(); N]),
            write_idx: AtomicU32::new(0),
            read_idx: AtomicU32::new(0),
            dropped: AtomicU32::new(0),
        }
    }

    /// Push one formatted line (producer side, interrupt-safe).
    ///
    /// Formats directly into the slot; never allocates, never blocks. On a
    /// full ring the oldest unread line is dropped to make room.
    pub fn push_args(&self, args: fmt::Arguments<'_>) {
        let write = self.write_idx.load(Ordering::Relaxed);
        let read = self.read_idx.load(Ordering::Acquire);

        if write.wrapping_sub(read) >= N as u32 {
            // Full: free the oldest slot. If the consumer claims it first
            // the exchange fails and the ring is no longer full.
            if self
                .read_idx
                .compare_exchange(
                    read,
                    read.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        let idx = (write & Self::MASK) as usize;
        // SAFETY: single producer; this slot is outside the consumer's
        // published range (or its claim was just invalidated above).
        unsafe {
            let line = &mut (*self.lines.get())[idx];
            let mut writer = LineWriter { line, pos: 0 };
            let _ = fmt::write(&mut writer, args);
            let pos = writer.pos;
            writer.line.len = pos as u8;
        }

        self.write_idx.store(write.wrapping_add(1), Ordering::Release);
    }

    /// Pop the oldest line (consumer side).
    pub fn drain(&self) -> Option<TraceLine> {
        loop {
            let read = self.read_idx.load(Ordering::Relaxed);
            let write = self.write_idx.load(Ordering::Acquire);
            if read == write {
                return None;
            }
            let idx = (read & Self::MASK) as usize;
            // SAFETY: copy first, claim second. If the producer recycled
            // this slot meanwhile, the claim fails and the copy is thrown
            // away.
            let line = unsafe { (*self.lines.get())[idx] };
            if self
                .read_idx
                .compare_exchange(
                    read,
                    read.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Some(line);
            }
        }
    }

    /// True when at least one line is waiting.
    pub fn has_lines(&self) -> bool {
        self.read_idx.load(Ordering::Relaxed) != self.write_idx.load(Ordering::Acquire)
    }

    /// Number of lines waiting to be drained.
    pub fn pending(&self) -> u32 {
        let read = self.read_idx.load(Ordering::Relaxed);
        let write = self.write_idx.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// Number of lines dropped to overflow since construction.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<const N: usize> Default for TraceBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

struct LineWriter<'a> {
    line: &'a mut TraceLine,
    pos: usize,
}

impl fmt::Write for LineWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let room = LINE_LEN - self.pos;
        let take = bytes.len().min(room);
        self.line.buf[self.pos..self.pos + take].copy_from_slice(&bytes[..take]);
        self.pos += take;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_drain() {
        let buf: TraceBuf<8> = TraceBuf::new();
        assert!(!buf.has_lines());

        buf.push_args(format_args!("hello {}", 42));
        assert!(buf.has_lines());
        assert_eq!(buf.pending(), 1);

        let line = buf.drain().unwrap();
        assert_eq!(line.as_str(), "hello 42");
        assert!(buf.drain().is_none());
    }

    #[test]
    fn drains_in_order() {
        let buf: TraceBuf<8> = TraceBuf::new();
        for i in 0..4 {
            buf.push_args(format_args!("line {}", i));
        }
        for i in 0..4 {
            assert_eq!(buf.drain().unwrap().as_str(), format!("line {}", i));
        }
    }

    #[test]
    fn overflow_drops_oldest() {
        let buf: TraceBuf<4> = TraceBuf::new();
        for i in 0..6 {
            buf.push_args(format_args!("line {}", i));
        }
        assert_eq!(buf.dropped(), 2);
        // lines 0 and 1 are gone
        assert_eq!(buf.drain().unwrap().as_str(), "line 2");
        assert_eq!(buf.drain().unwrap().as_str(), "line 3");
        assert_eq!(buf.drain().unwrap().as_str(), "line 4");
        assert_eq!(buf.drain().unwrap().as_str(), "line 5");
        assert!(buf.drain().is_none());
    }

    #[test]
    fn long_lines_truncate() {
        let buf: TraceBuf<4> = TraceBuf::new();
        let long = "x".repeat(LINE_LEN * 2);
        buf.push_args(format_args!("{}", long));
        let line = buf.drain().unwrap();
        assert_eq!(line.as_str().len(), LINE_LEN);
    }

    #[test]
    fn concurrent_producer_consumer() {
        use std::sync::Arc;
        use std::thread;

        let buf: Arc<TraceBuf<64>> = Arc::new(TraceBuf::new());
        let producer = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                for i in 0..1000u32 {
                    buf.push_args(format_args!("{}", i));
                }
            })
        };

        let mut seen = 0u32;
        while seen + buf.dropped() < 1000 {
            if buf.drain().is_some() {
                seen += 1;
            }
        }
        producer.join().unwrap();
        while buf.drain().is_some() {
            seen += 1;
        }
        assert_eq!(seen + buf.dropped(), 1000);
    }
}
