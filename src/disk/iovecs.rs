//! Turns a piece's block buffers into the vectored I/O that positional
//! scatter-write/read needs.
//!
//! `pwritev`/`preadv` are not guaranteed to drain the whole buffer list in
//! a single syscall, and a piece may straddle more than one file, so this
//! is a small cursor over a piece's buffers that can be bounded to the
//! portion that fits a single file and resumed after a partial write.

pub(super) use nix::sys::uio::IoVec;

/// A window over a piece's block buffers.
pub(super) struct IoVecs<'a> {
    /// The byte slices still to be written (or read into) in this window,
    /// in order. Re-sliced in place as bytes are consumed.
    bufs: Vec<&'a [u8]>,
    /// Buffers (and the unconsumed remainder of a split buffer) held back
    /// by `bounded`, returned to the caller via `into_tail`.
    tail: Vec<&'a [u8]>,
}

impl<'a> IoVecs<'a> {
    /// Takes the entire buffer list; nothing is held back as a tail.
    pub fn unbounded(bufs: &[IoVec<&'a [u8]>]) -> Self {
        Self { bufs: bufs.iter().map(|b| b.as_slice()).collect(), tail: Vec::new() }
    }

    /// Takes as many leading buffers as fit within `limit` bytes,
    /// splitting the buffer that straddles the boundary (if any). The
    /// rest, including the split-off remainder, is recoverable via
    /// `into_tail`.
    pub fn bounded(bufs: &[IoVec<&'a [u8]>], limit: usize) -> Self {
        let mut taken = Vec::new();
        let mut tail = Vec::new();
        let mut remaining = limit;
        let mut iter = bufs.iter().map(|b| b.as_slice());
        for slice in &mut iter {
            if remaining == 0 {
                tail.push(slice);
                continue;
            }
            if slice.len() <= remaining {
                remaining -= slice.len();
                taken.push(slice);
            } else {
                let (head, rest) = slice.split_at(remaining);
                taken.push(head);
                tail.push(rest);
                remaining = 0;
            }
        }
        Self { bufs: taken, tail }
    }

    /// The buffers remaining in this window, ready to hand to `pwritev`/
    /// `preadv`.
    pub fn buffers(&self) -> Vec<IoVec<&'a [u8]>> {
        self.bufs.iter().map(|s| IoVec::from_slice(s)).collect()
    }

    /// Returns whether every buffer in this window has been consumed.
    pub fn is_empty(&self) -> bool {
        self.bufs.is_empty()
    }

    /// Drops `n` bytes from the front of the window after a (possibly
    /// partial) vectored write/read.
    pub fn advance(&mut self, mut n: usize) {
        while n > 0 {
            if self.bufs.is_empty() {
                break;
            }
            let len = self.bufs[0].len();
            if n < len {
                self.bufs[0] = &self.bufs[0][n..];
                break;
            }
            n -= len;
            self.bufs.remove(0);
        }
    }

    /// Consumes this window and returns the buffers held back by
    /// `bounded`, to resume with the next file the piece overlaps with.
    pub fn into_tail(self) -> Vec<&'a [u8]> {
        self.tail
    }

    /// Rebuilds a window from a tail returned by `into_tail`, optionally
    /// bounding it again for the next file.
    pub fn from_tail(tail: Vec<&'a [u8]>, limit: Option<usize>) -> Self {
        match limit {
            None => Self { bufs: tail, tail: Vec::new() },
            Some(limit) => {
                let iovecs: Vec<IoVec<&'a [u8]>> =
                    tail.into_iter().map(IoVec::from_slice).collect();
                Self::bounded(&iovecs, limit)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_takes_every_buffer() {
        let a = b"hello".as_ref();
        let b = b"world".as_ref();
        let src = vec![IoVec::from_slice(a), IoVec::from_slice(b)];
        let iovecs = IoVecs::unbounded(&src);
        assert_eq!(iovecs.buffers().len(), 2);
        assert!(iovecs.into_tail().is_empty());
    }

    #[test]
    fn bounded_splits_straddling_buffer() {
        let a = b"hello".as_ref(); // 5 bytes
        let b = b"world".as_ref(); // 5 bytes
        let src = vec![IoVec::from_slice(a), IoVec::from_slice(b)];
        // limit of 7 bytes takes all of `a` and the first two bytes of `b`
        let iovecs = IoVecs::bounded(&src, 7);
        let taken: Vec<u8> =
            iovecs.buffers().iter().flat_map(|b| b.as_slice().to_vec()).collect();
        assert_eq!(taken, b"hellowo");
        let tail = iovecs.into_tail();
        assert_eq!(tail, vec![b"rld".as_ref()]);
    }

    #[test]
    fn advance_consumes_from_the_front() {
        let a = b"hello".as_ref();
        let b = b"world".as_ref();
        let src = vec![IoVec::from_slice(a), IoVec::from_slice(b)];
        let mut iovecs = IoVecs::unbounded(&src);
        iovecs.advance(7);
        let remaining: Vec<u8> =
            iovecs.buffers().iter().flat_map(|b| b.as_slice().to_vec()).collect();
        assert_eq!(remaining, b"rld");
        iovecs.advance(3);
        assert!(iovecs.is_empty());
    }
}
