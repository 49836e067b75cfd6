//! Output sinks shared between concurrently running procs.
//!
//! Every write takes the sink lock, so concurrent writers cannot
//! interleave within a single write. `std` streams additionally go through
//! [`LinePrefixer`], which buffers until a write ends in a newline, so
//! output from interleaved procs stays line-atomic.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// A write-serialized, shareable byte sink.
pub type SharedSink = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// Wrap a writer in a [`SharedSink`].
pub fn shared<W>(writer: W) -> SharedSink
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    Arc::new(Mutex::new(Box::new(writer)))
}

/// Write the whole buffer under the sink lock.
pub async fn write_all(sink: &SharedSink, buf: &[u8]) -> io::Result<()> {
    let mut writer = sink.lock().await;
    writer.write_all(buf).await?;
    writer.flush().await
}

/// Line-buffered prefixing writer.
///
/// Accumulates bytes until a write ends in `\n`, then flushes the whole
/// buffer — prefix included, once — to the sink. The flush condition is
/// "last byte of the current write is a newline", not "contains one".
/// Partial trailing lines at stream end are dropped.
pub struct LinePrefixer {
    sink: SharedSink,
    buf: Vec<u8>,
    prefix_len: usize,
}

impl std::fmt::Debug for LinePrefixer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinePrefixer")
            .field("buf", &self.buf)
            .field("prefix_len", &self.prefix_len)
            .finish()
    }
}

impl LinePrefixer {
    pub fn new(prefix: &str, sink: SharedSink) -> Self {
        let buf = prefix.as_bytes().to_vec();
        let prefix_len = buf.len();
        Self {
            sink,
            buf,
            prefix_len,
        }
    }

    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.buf.extend_from_slice(chunk);
        if self.buf.last() != Some(&b'\n') {
            return Ok(());
        }
        write_all(&self.sink, &self.buf).await?;
        self.buf.truncate(self.prefix_len);
        Ok(())
    }
}
