//! Buffered byte writing onto a chunk sink.

use crate::core::error::{Error, Result, StopReason};
use crate::core::traits::Writer;

/// Default flush threshold in bytes.
pub const DEFAULT_BUF_SIZE: usize = 16384;

macro_rules! write_num {
    ($name:ident, $ty:ty, $conv:ident) => {
        #[doc = concat!("Write a `", stringify!($ty), "` (`", stringify!($conv), "`).")]
        pub async fn $name(&mut self, value: $ty) -> Result<()> {
            self.write(&value.$conv()).await
        }
    };
}

/// A byte-oriented writer that buffers up to `buf_size` bytes before
/// flushing a chunk to the underlying writer.
pub struct ByteWriter<W> {
    downstream: W,
    buf: Vec<u8>,
    buf_size: usize,
    ended: bool,
}

impl<W: Writer<Item = Vec<u8>>> ByteWriter<W> {
    pub fn new(downstream: W) -> Self {
        Self::with_capacity(downstream, DEFAULT_BUF_SIZE)
    }

    pub fn with_capacity(downstream: W, buf_size: usize) -> Self {
        Self {
            downstream,
            buf: Vec::new(),
            buf_size: buf_size.max(1),
            ended: false,
        }
    }

    /// Append bytes, flushing whenever the buffer reaches the threshold.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.ended {
            return Err(Error::protocol("write after end"));
        }
        self.buf.extend_from_slice(bytes);
        if self.buf.len() >= self.buf_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Push the buffered bytes downstream as one chunk.
    pub async fn flush(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            let chunk = std::mem::take(&mut self.buf);
            self.downstream.write(Some(chunk)).await?;
        }
        Ok(())
    }

    /// Flush and close the underlying writer.
    pub async fn end(&mut self) -> Result<()> {
        if self.ended {
            return Ok(());
        }
        self.flush().await?;
        self.ended = true;
        self.downstream.write(None).await
    }

    /// Abort without flushing.
    pub async fn stop(&mut self, reason: StopReason) -> Result<()> {
        self.ended = true;
        self.buf.clear();
        self.downstream.stop(reason).await
    }

    pub fn into_inner(self) -> W {
        self.downstream
    }

    write_num!(write_u8, u8, to_be_bytes);
    write_num!(write_i8, i8, to_be_bytes);
    write_num!(write_u16_be, u16, to_be_bytes);
    write_num!(write_u16_le, u16, to_le_bytes);
    write_num!(write_i16_be, i16, to_be_bytes);
    write_num!(write_i16_le, i16, to_le_bytes);
    write_num!(write_u32_be, u32, to_be_bytes);
    write_num!(write_u32_le, u32, to_le_bytes);
    write_num!(write_i32_be, i32, to_be_bytes);
    write_num!(write_i32_le, i32, to_le_bytes);
    write_num!(write_f32_be, f32, to_be_bytes);
    write_num!(write_f32_le, f32, to_le_bytes);
    write_num!(write_f64_be, f64, to_be_bytes);
    write_num!(write_f64_le, f64, to_le_bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::BufferWriter;

    #[tokio::test]
    async fn buffers_until_threshold() {
        let sink = BufferWriter::new();
        let observed = sink.data();
        let mut w = ByteWriter::with_capacity(sink, 4);
        w.write(&[1, 2]).await.unwrap();
        assert!(observed.lock().await.is_empty());
        w.write(&[3, 4]).await.unwrap();
        assert_eq!(*observed.lock().await, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn end_flushes_the_tail() {
        let sink = BufferWriter::new();
        let observed = sink.data();
        let mut w = ByteWriter::new(sink);
        w.write_u16_be(0x0102).await.unwrap();
        w.write_u16_le(0x0102).await.unwrap();
        w.end().await.unwrap();
        assert_eq!(*observed.lock().await, vec![0x01, 0x02, 0x02, 0x01]);
        assert!(w.write(&[0]).await.is_err());
    }

    #[tokio::test]
    async fn stop_discards_the_buffer() {
        let sink = BufferWriter::new();
        let observed = sink.data();
        let mut w = ByteWriter::new(sink);
        w.write(&[9, 9, 9]).await.unwrap();
        w.stop(StopReason::None).await.unwrap();
        assert!(observed.lock().await.is_empty());
    }
}
