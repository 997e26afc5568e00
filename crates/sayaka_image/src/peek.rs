//! A peekable stream for format sniffing.
//!
//! Image type detection needs to read some head bytes and rewind, but the
//! source (a socket, a pipe) is generally not seekable, and buffering the
//! whole stream just for sniffing would be wasted work on top of whatever
//! the decoders buffer themselves. So there are two phases: a sniff handle
//! whose reads land in a growable internal buffer and which may seek freely
//! within it, and a forward read handle that drains the buffered prefix
//! first and then reads the source directly.

use std::io::{self, Read, Seek, SeekFrom};

const PEEK_CHUNK: usize = 1024;

pub struct PeekStream<R> {
    inner: R,
    buf: Vec<u8>,
    /// Position as seen by the upper layer.
    pos: usize,
    /// The source hit EOF while filling the peek buffer.
    done: bool,
}

impl<R: Read> PeekStream<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
            done: false,
        }
    }

    /// Seekable handle for the sniff phase.
    pub fn peek_handle(&mut self) -> PeekHandle<'_, R> {
        PeekHandle { ps: self }
    }

    /// Forward handle for the decode phase. Starts at the current position;
    /// rewind the peek handle to 0 first if the decoder must see the stream
    /// from the beginning.
    pub fn read_handle(&mut self) -> ReadHandle<'_, R> {
        ReadHandle { ps: self }
    }

    fn seek_in_prefix(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let newpos = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "peek stream cannot seek from end",
                ));
            }
        };
        if newpos < 0 || newpos as usize > self.buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside the peeked prefix",
            ));
        }
        self.pos = newpos as usize;
        Ok(self.pos as u64)
    }
}

pub struct PeekHandle<'a, R> {
    ps: &'a mut PeekStream<R>,
}

impl<R: Read> Read for PeekHandle<'_, R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let ps = &mut *self.ps;
        while ps.pos == ps.buf.len() {
            if ps.done {
                return Ok(0);
            }
            // Grow and refill from the source.
            let old = ps.buf.len();
            ps.buf.resize(old + PEEK_CHUNK, 0);
            let n = ps.inner.read(&mut ps.buf[old..])?;
            ps.buf.truncate(old + n);
            if n == 0 {
                ps.done = true;
            }
        }
        let len = dst.len().min(ps.buf.len() - ps.pos);
        dst[..len].copy_from_slice(&ps.buf[ps.pos..ps.pos + len]);
        ps.pos += len;
        Ok(len)
    }
}

impl<R: Read> Seek for PeekHandle<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.ps.seek_in_prefix(pos)
    }
}

pub struct ReadHandle<'a, R> {
    ps: &'a mut PeekStream<R>,
}

impl<R: Read> Read for ReadHandle<'_, R> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let ps = &mut *self.ps;
        let len = if ps.pos < ps.buf.len() {
            let len = dst.len().min(ps.buf.len() - ps.pos);
            dst[..len].copy_from_slice(&ps.buf[ps.pos..ps.pos + len]);
            len
        } else {
            ps.inner.read(dst)?
        };
        ps.pos += len;
        Ok(len)
    }
}

impl<R: Read> Seek for ReadHandle<'_, R> {
    /// Rewind is only possible within the peeked prefix; everything past it
    /// is forward-only.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if self.ps.pos > self.ps.buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "already past the peeked prefix",
            ));
        }
        self.ps.seek_in_prefix(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn sniff_then_read_sees_identical_bytes() {
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let mut ps = PeekStream::new(Cursor::new(data.clone()));

        let mut head = [0u8; 16];
        let mut h = ps.peek_handle();
        h.read_exact(&mut head).unwrap();
        assert_eq!(&head[..], &data[..16]);
        h.seek(SeekFrom::Start(0)).unwrap();

        let mut all = Vec::new();
        ps.read_handle().read_to_end(&mut all).unwrap();
        assert_eq!(all, data);
    }

    #[test]
    fn seek_past_prefix_fails() {
        let mut ps = PeekStream::new(Cursor::new(vec![1u8, 2, 3]));
        let mut h = ps.peek_handle();
        let mut b = [0u8; 2];
        h.read_exact(&mut b).unwrap();
        // Only [0, peek_len] is reachable.
        assert!(h.seek(SeekFrom::Start(100)).is_err());
        assert!(h.seek(SeekFrom::End(0)).is_err());
        assert_eq!(h.seek(SeekFrom::Start(1)).unwrap(), 1);
    }

    #[test]
    fn peek_handles_eof() {
        let mut ps = PeekStream::new(Cursor::new(vec![7u8; 5]));
        let mut h = ps.peek_handle();
        let mut all = Vec::new();
        h.read_to_end(&mut all).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(h.read(&mut [0u8; 4]).unwrap(), 0);
    }
}
