//! Reassemble streamed output chunks into newline-delimited lines.

use std::fmt;

type LineHandler = Box<dyn FnMut(String) + Send>;

/// Collects arbitrary-sized chunks and emits one line per newline found.
///
/// The buffer holds raw bytes, so a UTF-8 sequence split across two chunks is
/// reassembled before the line is decoded. Lines are emitted without their
/// trailing `\n`.
///
/// Only one handler is registered at a time; registering another replaces it.
/// Lines completed while no handler is registered are held and delivered to
/// the next handler.
#[derive(Default)]
pub struct LineCollector {
    partial: Vec<u8>,
    held: Vec<String>,
    handler: Option<LineHandler>,
}

impl LineCollector {
    /// Create an empty collector with no handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the line handler, replacing any previous one.
    ///
    /// Held lines are delivered to it immediately, in order.
    pub fn on<F>(&mut self, handler: F)
    where
        F: FnMut(String) + Send + 'static,
    {
        let mut handler: LineHandler = Box::new(handler);
        for line in self.held.drain(..) {
            handler(line);
        }
        self.handler = Some(handler);
    }

    /// Feed a chunk. Invokes the handler synchronously once per completed line.
    pub fn receive(&mut self, chunk: impl AsRef<[u8]>) {
        let mut rest = chunk.as_ref();
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            self.emit();
            rest = &rest[pos + 1..];
        }
        self.partial.extend_from_slice(rest);
    }

    /// Emit whatever partial line is buffered. Used when the stream closes.
    pub fn flush(&mut self) {
        if !self.partial.is_empty() {
            self.emit();
        }
    }

    /// Bytes buffered for the current, incomplete line.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Completed lines waiting for a handler.
    #[must_use]
    pub fn held(&self) -> usize {
        self.held.len()
    }

    fn emit(&mut self) {
        let bytes = std::mem::take(&mut self.partial);
        let line = match String::from_utf8(bytes) {
            Ok(line) => line,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };
        match self.handler.as_mut() {
            Some(handler) => handler(line),
            None => {
                tracing::trace!(
                    held = self.held.len() + 1,
                    "Holding line until a handler is registered"
                );
                self.held.push(line);
            }
        }
    }
}

impl fmt::Debug for LineCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineCollector")
            .field("pending", &self.partial.len())
            .field("held", &self.held.len())
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn collect() -> (LineCollector, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let mut collector = LineCollector::new();
        let sink = Arc::clone(&lines);
        collector.on(move |line| sink.lock().unwrap().push(line));
        (collector, lines)
    }

    #[test]
    fn test_groups_text_by_line() {
        let (mut collector, lines) = collect();
        collector.receive("abc");
        collector.receive("def");
        assert!(lines.lock().unwrap().is_empty());
        collector.receive("\n");
        assert_eq!(*lines.lock().unwrap(), vec!["abcdef"]);
    }

    #[test]
    fn test_each_line_once() {
        let (mut collector, lines) = collect();
        collector.receive("abc\n");
        collector.receive("def\n");
        assert_eq!(*lines.lock().unwrap(), vec!["abc", "def"]);
        collector.flush();
        assert_eq!(lines.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_flush_emits_partial() {
        let (mut collector, lines) = collect();
        collector.receive("abc");
        collector.receive("def");
        assert!(lines.lock().unwrap().is_empty());
        collector.flush();
        assert_eq!(*lines.lock().unwrap(), vec!["abcdef"]);
        assert_eq!(collector.pending(), 0);
    }

    #[test]
    fn test_several_newlines_in_one_chunk() {
        let (mut collector, lines) = collect();
        collector.receive("a\nb\n\nc");
        assert_eq!(*lines.lock().unwrap(), vec!["a", "b", ""]);
        collector.flush();
        assert_eq!(*lines.lock().unwrap(), vec!["a", "b", "", "c"]);
    }

    #[test]
    fn test_any_partition_loses_nothing() {
        let text = "first line\nsecond\n\nfourth has more words\nlast";
        let expected: Vec<&str> = text.split('\n').collect();
        for size in 1..=text.len() {
            let (mut collector, lines) = collect();
            for chunk in text.as_bytes().chunks(size) {
                collector.receive(chunk);
            }
            collector.flush();
            assert_eq!(*lines.lock().unwrap(), expected, "chunk size {size}");
        }
    }

    #[test]
    fn test_split_utf8_sequence() {
        let (mut collector, lines) = collect();
        let bytes = "héllo\n".as_bytes();
        collector.receive(&bytes[..2]);
        collector.receive(&bytes[2..]);
        assert_eq!(*lines.lock().unwrap(), vec!["héllo"]);
    }

    #[test]
    fn test_lines_before_handler_are_held() {
        let mut collector = LineCollector::new();
        collector.receive("early\nsecond\npart");
        assert_eq!(collector.held(), 2);

        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lines);
        collector.on(move |line| sink.lock().unwrap().push(line));
        assert_eq!(*lines.lock().unwrap(), vec!["early", "second"]);
        assert_eq!(collector.held(), 0);

        collector.flush();
        assert_eq!(*lines.lock().unwrap(), vec!["early", "second", "part"]);
    }

    #[test]
    fn test_last_handler_wins() {
        let first = Arc::new(Mutex::new(Vec::new()));
        let (mut collector, second) = collect();
        let sink = Arc::clone(&first);
        collector.on(move |line| sink.lock().unwrap().push(line));
        collector.receive("x\n");
        assert_eq!(*first.lock().unwrap(), vec!["x"]);
        assert!(second.lock().unwrap().is_empty());
    }
}
