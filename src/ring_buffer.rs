//! Fixed-capacity byte ring holding the most recent terminal output

/// Byte arena that keeps the last `capacity` bytes written to it
#[derive(Debug, Clone)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    /// Index of the oldest byte
    start: usize,
    len: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append bytes, evicting the oldest ones once full
    pub fn push(&mut self, data: &[u8]) {
        let cap = self.capacity();
        if cap == 0 || data.is_empty() {
            return;
        }

        if data.len() >= cap {
            self.buf.copy_from_slice(&data[data.len() - cap..]);
            self.start = 0;
            self.len = cap;
            return;
        }

        let write_at = (self.start + self.len) % cap;
        let first = (cap - write_at).min(data.len());
        self.buf[write_at..write_at + first].copy_from_slice(&data[..first]);
        self.buf[..data.len() - first].copy_from_slice(&data[first..]);

        let total = self.len + data.len();
        if total > cap {
            self.start = (self.start + total - cap) % cap;
            self.len = cap;
        } else {
            self.len = total;
        }
    }

    /// Buffered bytes, oldest first
    pub fn contents(&self) -> Vec<u8> {
        let cap = self.capacity();
        let mut out = Vec::with_capacity(self.len);
        if self.len == 0 {
            return out;
        }
        let end = self.start + self.len;
        if end <= cap {
            out.extend_from_slice(&self.buf[self.start..end]);
        } else {
            out.extend_from_slice(&self.buf[self.start..]);
            out.extend_from_slice(&self.buf[..end - cap]);
        }
        out
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_everything_below_capacity() {
        let mut ring = RingBuffer::new(16);
        ring.push(b"hello ");
        ring.push(b"world");
        assert_eq!(ring.contents(), b"hello world");
        assert_eq!(ring.len(), 11);
    }

    #[test]
    fn test_evicts_oldest_bytes() {
        let mut ring = RingBuffer::new(8);
        ring.push(b"abcdef");
        ring.push(b"ghij");
        assert_eq!(ring.contents(), b"cdefghij");
        ring.push(b"k");
        assert_eq!(ring.contents(), b"defghijk");
        assert_eq!(ring.len(), 8);
    }

    #[test]
    fn test_oversized_write_keeps_tail() {
        let mut ring = RingBuffer::new(4);
        ring.push(b"xy");
        ring.push(b"0123456789");
        assert_eq!(ring.contents(), b"6789");
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut ring = RingBuffer::new(1000);
        let mut expected = Vec::new();
        for i in 0..500u32 {
            let chunk = format!("line {i}\n");
            ring.push(chunk.as_bytes());
            expected.extend_from_slice(chunk.as_bytes());
            assert!(ring.len() <= ring.capacity());
        }
        assert_eq!(ring.contents(), expected[expected.len() - 1000..]);
    }

    #[test]
    fn test_zero_capacity_and_clear() {
        let mut ring = RingBuffer::new(0);
        ring.push(b"data");
        assert!(ring.is_empty());

        let mut ring = RingBuffer::new(4);
        ring.push(b"abc");
        ring.clear();
        assert!(ring.is_empty());
        ring.push(b"z");
        assert_eq!(ring.contents(), b"z");
    }
}
