//! Background consumer of the tunnel client's output
//!
//! One task reads the merged output line by line, keeps a bounded tail for
//! diagnostics and raises two one-shot latches: `ready` when the marker line
//! shows up and `exited` once the stream is closed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Log target of echoed client lines
pub const CLIENT_LOG_TARGET: &str = "vpnward::client";

/// Write-once, read-many flag
#[derive(Debug, Clone, Default)]
pub struct Latch(Arc<AtomicBool>);

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the latch; it never goes back down
    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Most recent output lines
///
/// Grows to twice its retention before dropping the oldest lines in one go.
#[derive(Debug, Clone)]
pub struct TailBuffer {
    lines: VecDeque<String>,
    keep: usize,
}

impl TailBuffer {
    pub fn new(keep: usize) -> Self {
        let keep = keep.max(1);
        Self {
            lines: VecDeque::with_capacity(keep * 2),
            keep,
        }
    }

    pub fn push(&mut self, line: String) {
        self.lines.push_back(line);
        if self.lines.len() > self.keep * 2 {
            let excess = self.lines.len() - self.keep;
            self.lines.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn keep(&self) -> usize {
        self.keep
    }

    /// The last `keep` lines, each terminated by a newline
    pub fn snapshot(&self) -> String {
        let skip = self.lines.len().saturating_sub(self.keep);
        self.lines.iter().skip(skip).fold(String::new(), |mut out, line| {
            out.push_str(line);
            out.push('\n');
            out
        })
    }
}

/// What the watcher looks for and how much it keeps
#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub marker: String,
    pub keep_last_n: usize,
    /// Log every line at DEBUG under [`CLIENT_LOG_TARGET`]
    pub echo: bool,
}

/// Handle to a running output watcher
#[derive(Debug)]
pub struct OutputWatcher {
    tail: Arc<Mutex<TailBuffer>>,
    ready: Latch,
    exited: Latch,
    task: JoinHandle<()>,
}

impl OutputWatcher {
    /// Start consuming `output` on a background task
    pub fn spawn<R>(output: R, options: WatcherOptions, ready: Latch, exited: Latch) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tail = Arc::new(Mutex::new(TailBuffer::new(options.keep_last_n)));
        let task = tokio::spawn(watch(
            LineSource::new(output),
            options,
            Arc::clone(&tail),
            ready.clone(),
            exited.clone(),
        ));

        Self {
            tail,
            ready,
            exited,
            task,
        }
    }

    pub fn ready(&self) -> bool {
        self.ready.is_set()
    }

    pub fn exited(&self) -> bool {
        self.exited.is_set()
    }

    /// Snapshot of the retained tail
    pub fn tail(&self) -> String {
        self.tail.lock().unwrap().snapshot()
    }

    pub fn tail_len(&self) -> usize {
        self.tail.lock().unwrap().len()
    }

    /// Wait at most `limit` for the output stream to close
    pub async fn wait_exited(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while !self.exited() {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

impl Drop for OutputWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Raises `exited` however the read loop ends
struct ExitGuard(Latch);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.set();
    }
}

struct LineSource<R> {
    reader: BufReader<R>,
    partial: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineSource<R> {
    fn new(stream: R) -> Self {
        Self {
            reader: BufReader::new(stream),
            partial: Vec::new(),
        }
    }

    /// Next line without its terminator, `None` at end of stream
    ///
    /// Invalid UTF-8 is replaced rather than ending the stream.
    async fn next_line(&mut self) -> Option<String> {
        match self.reader.read_until(b'\n', &mut self.partial).await {
            Ok(0) => None,
            Ok(_) => {
                let mut bytes = std::mem::take(&mut self.partial);
                if bytes.last() == Some(&b'\n') {
                    bytes.pop();
                }
                if bytes.last() == Some(&b'\r') {
                    bytes.pop();
                }
                Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            Err(e) => {
                debug!("Client output stream failed: {}", e);
                None
            }
        }
    }
}

async fn watch<R>(
    mut source: LineSource<R>,
    options: WatcherOptions,
    tail: Arc<Mutex<TailBuffer>>,
    ready: Latch,
    exited: Latch,
) where
    R: AsyncRead + Unpin,
{
    let _guard = ExitGuard(exited);

    while let Some(line) = source.next_line().await {
        if options.echo {
            debug!(target: CLIENT_LOG_TARGET, "{}", line);
        }
        let is_marker = !ready.is_set() && line.contains(&options.marker);
        // The marker line must be in the tail before anyone sees `ready`
        tail.lock().unwrap().push(line);
        if is_marker {
            info!("Tunnel client reported initialization");
            ready.set();
        }
    }

    debug!("Client output stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const MARKER: &str = "Initialization Sequence Completed";

    fn options(keep_last_n: usize) -> WatcherOptions {
        WatcherOptions {
            marker: MARKER.to_string(),
            keep_last_n,
            echo: false,
        }
    }

    #[test]
    fn test_tail_buffer_bound_and_trim() {
        let mut tail = TailBuffer::new(3);
        for n in 0..50 {
            tail.push(format!("line {}", n));
            assert!(tail.len() <= 6);
            if n == 6 {
                // Seventh line crosses 2 * keep and trims back to keep
                assert_eq!(tail.len(), 3);
            }
        }
        assert_eq!(tail.snapshot(), "line 47\nline 48\nline 49\n");
    }

    #[test]
    fn test_tail_snapshot_of_short_buffer() {
        let mut tail = TailBuffer::new(300);
        assert_eq!(tail.snapshot(), "");
        tail.push("only".to_string());
        assert_eq!(tail.snapshot(), "only\n");
    }

    #[test]
    fn test_latch_is_shared_and_monotonic() {
        let latch = Latch::new();
        let observer = latch.clone();
        assert!(!observer.is_set());
        latch.set();
        latch.set();
        assert!(observer.is_set());
    }

    #[tokio::test]
    async fn test_marker_sets_ready_and_eof_sets_exited() {
        let output: &'static [u8] =
            b"starting\nwarning: cipher\nInitialization Sequence Completed\nrunning\n";
        let watcher = OutputWatcher::spawn(output, options(300), Latch::new(), Latch::new());

        assert!(watcher.wait_exited(Duration::from_secs(2)).await);
        assert!(watcher.ready());
        assert_eq!(
            watcher.tail(),
            "starting\nwarning: cipher\nInitialization Sequence Completed\nrunning\n"
        );
        assert_eq!(watcher.tail_len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_marker_is_in_tail_once_ready() {
        for _ in 0..20 {
            let (mut writer, reader) = tokio::io::duplex(1024);
            let ready = Latch::new();
            let watcher = OutputWatcher::spawn(reader, options(300), ready.clone(), Latch::new());

            writer
                .write_all(format!("connecting\n{}\n", MARKER).as_bytes())
                .await
                .unwrap();
            let deadline = Instant::now() + Duration::from_secs(2);
            while !ready.is_set() && Instant::now() < deadline {
                tokio::task::yield_now().await;
            }

            assert!(ready.is_set());
            assert!(watcher.tail().contains(MARKER));
        }
    }

    #[tokio::test]
    async fn test_no_marker_leaves_ready_unset() {
        let output: &'static [u8] = b"TLS handshake failed\r\n";
        let watcher = OutputWatcher::spawn(output, options(10), Latch::new(), Latch::new());

        assert!(watcher.wait_exited(Duration::from_secs(2)).await);
        assert!(!watcher.ready());
        assert_eq!(watcher.tail(), "TLS handshake failed\n");
    }

    #[tokio::test]
    async fn test_flags_stay_set_across_later_output() {
        let (mut writer, reader) = tokio::io::duplex(1024);
        let ready = Latch::new();
        let exited = Latch::new();
        let watcher = OutputWatcher::spawn(reader, options(2), ready.clone(), exited.clone());

        writer
            .write_all(format!("{}\n", MARKER).as_bytes())
            .await
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while !ready.is_set() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ready.is_set());
        assert!(!exited.is_set());

        for n in 0..10 {
            writer
                .write_all(format!("after {}\n", n).as_bytes())
                .await
                .unwrap();
            assert!(ready.is_set());
        }
        drop(writer);

        assert!(watcher.wait_exited(Duration::from_secs(2)).await);
        assert!(ready.is_set());
        assert!(exited.is_set());
        assert!(watcher.tail_len() <= 4);
        assert_eq!(watcher.tail(), "after 8\nafter 9\n");
    }

    #[tokio::test]
    async fn test_dropping_watcher_sets_exited() {
        let (_writer, reader) = tokio::io::duplex(64);
        let exited = Latch::new();
        let watcher = OutputWatcher::spawn(reader, options(5), Latch::new(), exited.clone());

        drop(watcher);

        let deadline = Instant::now() + Duration::from_secs(2);
        while !exited.is_set() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(exited.is_set());
    }
}
