use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;

/// A shared output sink. Tails run concurrently but each rendered line must
/// land as a single uninterrupted write, so the writer sits behind a mutex.
#[derive(Clone)]
pub struct Sink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Sink {
    pub fn stdout() -> Self {
        Self::from_writer(Box::new(std::io::stdout()))
    }

    pub fn stderr() -> Self {
        Self::from_writer(Box::new(std::io::stderr()))
    }

    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    /// Writes a string as-is. Write failures on a log stream are not
    /// actionable, so they are ignored like the rest of the pipeline does.
    pub fn write_str(&self, s: &str) {
        let mut writer = self.inner.lock();
        let _ = writer.write_all(s.as_bytes());
        let _ = writer.flush();
    }

    pub fn write_line(&self, s: &str) {
        let mut writer = self.inner.lock();
        let _ = writer.write_all(s.as_bytes());
        let _ = writer.write_all(b"\n");
        let _ = writer.flush();
    }
}

/// In-memory sink for tests.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct BufferSink {
    buf: Arc<Mutex<Vec<u8>>>,
}

#[cfg(test)]
impl BufferSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> Sink {
        Sink::from_writer(Box::new(self.clone()))
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock()).into_owned()
    }
}

#[cfg(test)]
impl Write for BufferSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buf.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_sink_round_trip() {
        let buffer = BufferSink::new();
        let sink = buffer.sink();
        sink.write_str("hello ");
        sink.write_line("world");
        assert_eq!(buffer.contents(), "hello world\n");
    }

    #[test]
    fn test_clones_share_the_writer() {
        let buffer = BufferSink::new();
        let sink = buffer.sink();
        let clone = sink.clone();
        sink.write_str("a");
        clone.write_str("b");
        assert_eq!(buffer.contents(), "ab");
    }
}
