//! Exact-length byte reading over a chunk stream.

use crate::core::error::{Error, Result, StopReason};
use crate::core::traits::{Headers, Reader};

macro_rules! read_num {
    ($name:ident, $ty:ty, $size:expr, $conv:ident) => {
        #[doc = concat!("Read a `", stringify!($ty), "` (`", stringify!($conv), "`).")]
        pub async fn $name(&mut self) -> Result<$ty> {
            let bytes = self.read($size).await?;
            let arr: [u8; $size] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::protocol("unexpected end of stream in numeric field"))?;
            Ok(<$ty>::$conv(arr))
        }
    };
}

/// A byte-oriented reader over a stream of byte chunks.
///
/// Maintains a sliding window over the upstream chunks: `read(len)`
/// returns exactly `len` bytes, fewer only once the upstream has ended.
/// `unread` rewinds at most the size of the last accepted read.
pub struct ByteReader<R> {
    upstream: R,
    buf: Vec<u8>,
    pos: usize,
    last_read: usize,
    ended: bool,
}

impl<R: Reader<Item = Vec<u8>>> ByteReader<R> {
    pub fn new(upstream: R) -> Self {
        Self {
            upstream,
            buf: Vec::new(),
            pos: 0,
            last_read: 0,
            ended: false,
        }
    }

    fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    async fn fill(&mut self, len: usize) -> Result<()> {
        while self.available() < len && !self.ended {
            match self.upstream.read().await? {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => self.ended = true,
            }
        }
        Ok(())
    }

    // bytes the unread window can no longer reach are dropped
    fn compact(&mut self) {
        let keep_from = self.pos - self.last_read;
        if keep_from > 0 {
            self.buf.drain(..keep_from);
            self.pos = self.last_read;
        }
    }

    /// Read exactly `len` bytes; a shorter (possibly empty) result means
    /// the stream ended.
    pub async fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        self.fill(len).await?;
        let take = len.min(self.available());
        let out = self.buf[self.pos..self.pos + take].to_vec();
        self.pos += take;
        self.last_read = take;
        self.compact();
        Ok(out)
    }

    /// Look at the next `len` bytes without consuming them; shorter only
    /// at end of stream.
    pub async fn peek(&mut self, len: usize) -> Result<Vec<u8>> {
        self.fill(len).await?;
        let take = len.min(self.available());
        Ok(self.buf[self.pos..self.pos + take].to_vec())
    }

    /// Everything remaining in the stream, without consuming it.
    pub async fn peek_all(&mut self) -> Result<Vec<u8>> {
        while !self.ended {
            match self.upstream.read().await? {
                Some(chunk) => self.buf.extend_from_slice(&chunk),
                None => self.ended = true,
            }
        }
        Ok(self.buf[self.pos..].to_vec())
    }

    /// Rewind `len` bytes, at most the size of the last accepted read.
    pub fn unread(&mut self, len: usize) -> Result<()> {
        if len > self.last_read {
            return Err(Error::protocol("unread beyond the last read"));
        }
        self.pos -= len;
        self.last_read -= len;
        Ok(())
    }

    /// Forward a stop to the upstream chunk reader.
    pub async fn stop(&mut self, reason: StopReason) -> Result<()> {
        self.upstream.stop(reason).await
    }

    pub fn headers(&self) -> Option<&Headers> {
        self.upstream.headers()
    }

    pub fn into_inner(self) -> R {
        self.upstream
    }

    read_num!(read_u8, u8, 1, from_be_bytes);
    read_num!(read_i8, i8, 1, from_be_bytes);
    read_num!(read_u16_be, u16, 2, from_be_bytes);
    read_num!(read_u16_le, u16, 2, from_le_bytes);
    read_num!(read_i16_be, i16, 2, from_be_bytes);
    read_num!(read_i16_le, i16, 2, from_le_bytes);
    read_num!(read_u32_be, u32, 4, from_be_bytes);
    read_num!(read_u32_le, u32, 4, from_le_bytes);
    read_num!(read_i32_be, i32, 4, from_be_bytes);
    read_num!(read_i32_le, i32, 4, from_le_bytes);
    read_num!(read_f32_be, f32, 4, from_be_bytes);
    read_num!(read_f32_le, f32, 4, from_le_bytes);
    read_num!(read_f64_be, f64, 8, from_be_bytes);
    read_num!(read_f64_le, f64, 8, from_le_bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::BufferReader;

    fn bytes(data: Vec<u8>) -> ByteReader<BufferReader> {
        // one-byte chunks stress the window across chunk joins
        ByteReader::new(BufferReader::new(data).chunk_size(1))
    }

    #[tokio::test]
    async fn read_exact_lengths_across_chunks() {
        let mut r = bytes(vec![1, 2, 3, 4, 5]);
        assert_eq!(r.read(2).await.unwrap(), vec![1, 2]);
        assert_eq!(r.read(3).await.unwrap(), vec![3, 4, 5]);
        assert_eq!(r.read(4).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn short_read_only_at_end() {
        let mut r = bytes(vec![9, 8, 7]);
        assert_eq!(r.read(5).await.unwrap(), vec![9, 8, 7]);
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let mut r = bytes(vec![1, 2, 3]);
        assert_eq!(r.peek(2).await.unwrap(), vec![1, 2]);
        assert_eq!(r.read(2).await.unwrap(), vec![1, 2]);
        assert_eq!(r.peek_all().await.unwrap(), vec![3]);
        assert_eq!(r.read(1).await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn unread_rewinds_within_the_last_read() {
        let mut r = bytes(vec![1, 2, 3, 4]);
        assert_eq!(r.read(3).await.unwrap(), vec![1, 2, 3]);
        r.unread(2).unwrap();
        assert_eq!(r.read(2).await.unwrap(), vec![2, 3]);
        // a second rewind past the accepted window is refused
        assert_eq!(r.read(1).await.unwrap(), vec![4]);
        assert!(r.unread(2).is_err());
    }

    #[tokio::test]
    async fn numeric_fields_both_endians() {
        let mut r = bytes(vec![0x01, 0x02, 0x01, 0x02, 0xff, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(r.read_u16_be().await.unwrap(), 0x0102);
        assert_eq!(r.read_u16_le().await.unwrap(), 0x0201);
        assert_eq!(r.read_i8().await.unwrap(), -1);
        assert_eq!(r.read_u32_be().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn truncated_numeric_field_is_a_protocol_error() {
        let mut r = bytes(vec![0x01]);
        assert!(r.read_u32_be().await.is_err());
    }

    #[tokio::test]
    async fn floats_round_trip_from_known_bytes() {
        let mut data = 1.5f64.to_be_bytes().to_vec();
        data.extend_from_slice(&2.25f32.to_le_bytes());
        let mut r = bytes(data);
        assert_eq!(r.read_f64_be().await.unwrap(), 1.5);
        assert_eq!(r.read_f32_le().await.unwrap(), 2.25);
    }
}
