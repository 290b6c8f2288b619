//! Thread-safe circular byte store with drop-oldest overflow.
//!
//! One writer thread and one reader thread may use the same buffer; every
//! operation runs under the instance mutex. Consumed bytes are physically
//! discarded on read so the unread region always starts at index 0 after a
//! read, and a write that does not fit evicts the oldest unread bytes.

use parking_lot::Mutex;

pub struct RingByteBuffer {
    inner: Mutex<RingState>,
}

struct RingState {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl RingState {
    fn unread(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Move the unread region to the front of the array.
    fn compact(&mut self) {
        if self.read_pos == 0 {
            return;
        }
        let unread = self.unread();
        self.buf.copy_within(self.read_pos..self.write_pos, 0);
        self.read_pos = 0;
        self.write_pos = unread;
    }

    fn reset_if_drained(&mut self) {
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }
}

impl RingByteBuffer {
    /// Create a buffer holding at most `capacity` unread bytes before eviction.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingState {
                buf: vec![0u8; capacity],
                read_pos: 0,
                write_pos: 0,
            }),
        }
    }

    /// Append `data`, evicting the oldest unread bytes when it does not fit.
    ///
    /// A single write larger than the whole array grows the array to fit it.
    /// Returns the number of evicted bytes.
    pub fn write(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let mut st = self.inner.lock();

        if st.buf.len() < data.len() {
            log::debug!(
                "ring buffer grows from {} to {} bytes for a burst",
                st.buf.len(),
                data.len()
            );
            st.buf.resize(data.len(), 0);
        }

        st.compact();

        let free = st.buf.len() - st.write_pos;
        let mut evicted = 0;
        if data.len() > free {
            evicted = data.len() - free;
            let end = st.write_pos;
            st.buf.copy_within(evicted..end, 0);
            st.write_pos -= evicted;
        }

        let start = st.write_pos;
        st.buf[start..start + data.len()].copy_from_slice(data);
        st.write_pos += data.len();
        evicted
    }

    /// Copy up to `dest.len()` unread bytes into `dest` and discard them.
    ///
    /// Returns the number of bytes copied; a short read leaves the tail of
    /// `dest` untouched.
    pub fn read(&self, dest: &mut [u8]) -> usize {
        let mut st = self.inner.lock();
        let n = dest.len().min(st.unread());
        if n == 0 {
            return 0;
        }
        let start = st.read_pos;
        dest[..n].copy_from_slice(&st.buf[start..start + n]);
        st.read_pos += n;
        st.reset_if_drained();
        st.compact();
        n
    }

    /// Read into `dest`, zero-filling whatever the buffer could not supply.
    pub fn read_padded(&self, dest: &mut [u8]) -> usize {
        let n = self.read(dest);
        dest[n..].fill(0);
        n
    }

    /// Unread bytes currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().unread()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current size of the backing array.
    pub fn capacity(&self) -> usize {
        self.inner.lock().buf.len()
    }

    pub fn clear(&self) {
        let mut st = self.inner.lock();
        st.read_pos = 0;
        st.write_pos = 0;
    }
}
