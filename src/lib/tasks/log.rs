use std::sync::Mutex;

pub const LOG_PREFIX: &str = "[dockworker] ";
const WRAP_WIDTH: usize = 80;

/// Append-only log of a single task run, kept whole for the bulk upload.
/// Writes after `end` are dropped.
pub struct TaskLog {
    inner: Mutex<LogBuffer>,
}

#[derive(Default)]
struct LogBuffer {
    data: Vec<u8>,
    closed: bool,
}

impl Default for TaskLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LogBuffer::default()),
        }
    }

    /// Returns false if the log was already closed.
    pub fn write(&self, chunk: impl AsRef<[u8]>) -> bool {
        let chunk = chunk.as_ref();
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return false;
        }
        inner.data.extend_from_slice(chunk);
        true
    }

    /// Write a final chunk and close in one step.
    pub fn end(&self, chunk: impl AsRef<[u8]>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.closed {
            inner.data.extend_from_slice(chunk.as_ref());
            inner.closed = true;
        }
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .data
            .clone()
    }

    #[cfg(test)]
    pub fn contents_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

/// Prefix, hard-wrap at 80 columns and terminate every line with CRLF.
pub fn fmt_log(message: &str) -> String {
    let line = format!("{LOG_PREFIX}{message}");
    let mut out = String::with_capacity(line.len() + 8);
    for raw in line.split('\n') {
        let raw = raw.trim_end_matches('\r');
        let chars: Vec<char> = raw.chars().collect();
        if chars.is_empty() {
            out.push_str("\r\n");
            continue;
        }
        for piece in chars.chunks(WRAP_WIDTH) {
            out.extend(piece.iter());
            out.push_str("\r\n");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_after_end_are_dropped() {
        let log = TaskLog::new();
        assert!(log.write("before\n"));
        log.end("footer\n");
        assert!(!log.write("after\n"));
        assert_eq!(log.contents_lossy(), "before\nfooter\n");
    }

    #[test]
    fn end_appends_then_closes() {
        let log = TaskLog::new();
        log.end("footer");
        log.end("ignored");
        assert!(log.is_closed());
        assert_eq!(log.contents_lossy(), "footer");
    }

    #[test]
    fn fmt_log_prefixes_and_wraps() {
        let short = fmt_log("abort");
        assert_eq!(short, "[dockworker] abort\r\n");

        let long = fmt_log(&"x".repeat(150));
        let lines: Vec<_> = long.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().all(|l| l.chars().count() <= 80));
    }
}
