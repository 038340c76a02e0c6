//! Helpers for turning a piece's downloaded blocks into vectored write
//! buffers for a single `pwritev` call, splitting the buffer list at file
//! boundaries when a piece spans more than one file.

use std::io::IoSlice;

/// A single buffer to be written, borrowing from a piece's in-memory block
/// data.
#[derive(Clone, Copy, Debug)]
pub struct IoVec<'a>(&'a [u8]);

impl<'a> IoVec<'a> {
    /// Wraps a byte slice as an `IoVec`.
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self(buf)
    }

    /// Returns the underlying byte slice.
    pub fn as_slice(&self) -> &'a [u8] {
        self.0
    }

    fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns the buffer with its first `n` bytes dropped.
    fn advance(&self, n: usize) -> Self {
        Self(&self.0[n..])
    }
}

/// A window over a sequence of [`IoVec`]s, used to drive a `pwritev` loop.
///
/// `pwritev` is not guaranteed to write the entire buffer list in one
/// syscall, so the caller needs to repeatedly call it with the not yet
/// written remainder. [`IoVecs::advance`] does this front-trimming. When a
/// piece spans multiple files, [`IoVecs::bounded`] additionally carves off
/// only the prefix of the buffer list that belongs to the file currently
/// being written, leaving the rest retrievable via [`IoVecs::into_tail`] for
/// the next file.
pub struct IoVecs<'a> {
    /// Buffers belonging to the current window, front-trimmed by `advance`.
    current: Vec<IoVec<'a>>,
    /// Buffers beyond this window's bound, handed back via `into_tail`.
    tail: Vec<IoVec<'a>>,
}

impl<'a> IoVecs<'a> {
    /// Creates a window over the entire buffer list.
    pub fn unbounded(bufs: Vec<IoVec<'a>>) -> Self {
        Self {
            current: bufs,
            tail: Vec::new(),
        }
    }

    /// Creates a window over at most `limit` bytes of the buffer list,
    /// splitting a buffer in two if it straddles the limit. The untaken
    /// remainder is available via `into_tail`.
    pub fn bounded(bufs: Vec<IoVec<'a>>, limit: usize) -> Self {
        let mut current = Vec::new();
        let mut tail = Vec::new();
        let mut remaining = limit;
        for v in bufs {
            if remaining == 0 {
                tail.push(v);
                continue;
            }
            if v.len() <= remaining {
                remaining -= v.len();
                current.push(v);
            } else {
                let (head, rest) = v.as_slice().split_at(remaining);
                current.push(IoVec::from_slice(head));
                tail.push(IoVec::from_slice(rest));
                remaining = 0;
            }
        }
        Self { current, tail }
    }

    /// Returns the current window's buffers as `IoSlice`s, ready to hand to
    /// a vectored write syscall.
    pub fn buffers(&self) -> Vec<IoSlice<'a>> {
        self.current
            .iter()
            .map(|v| IoSlice::new(v.as_slice()))
            .collect()
    }

    /// Returns true once the current window has been fully written.
    pub fn is_empty(&self) -> bool {
        self.current.iter().all(|v| v.len() == 0)
    }

    /// Drops the first `n` bytes from the current window, removing buffers
    /// that have been fully consumed and shrinking a partially consumed one.
    pub fn advance(&mut self, mut n: usize) {
        while n > 0 {
            if self.current.is_empty() {
                break;
            }
            let front_len = self.current[0].len();
            if n < front_len {
                self.current[0] = self.current[0].advance(n);
                n = 0;
            } else {
                n -= front_len;
                self.current.remove(0);
            }
        }
    }

    /// Consumes the window, returning the buffers that weren't part of it
    /// (empty unless this was created with `bounded`).
    pub fn into_tail(self) -> Vec<IoVec<'a>> {
        self.tail
    }
}
