//! In-memory link and PTY doubles for exercising the engine without hardware.

use crate::error::{BridgeError, BridgeResult};
use crate::link::{BleLink, LinkState, Notifications};
use crate::pty::{PtyAllocator, PtyPort};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Poisoning is ignored; the recorded data stays readable.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct PeerRecord {
    writes: Vec<Vec<u8>>,
    write_times: Vec<Instant>,
    write_attempts: usize,
    connects: Vec<String>,
    disconnects: usize,
    notify_tx: Option<mpsc::Sender<Vec<u8>>>,
}

/// A scripted BLE link.
pub struct MockLink {
    state: LinkState,
    mtu: Option<usize>,
    connect_error: Option<String>,
    failing_writes: usize,
    record: Arc<Mutex<PeerRecord>>,
}

/// The test's view of the peripheral behind a [`MockLink`].
#[derive(Clone)]
pub struct MockPeer {
    record: Arc<Mutex<PeerRecord>>,
}

impl MockLink {
    pub fn new() -> (Self, MockPeer) {
        let record = Arc::new(Mutex::new(PeerRecord::default()));
        let link = Self {
            state: LinkState::Connecting,
            mtu: None,
            connect_error: None,
            failing_writes: 0,
            record: record.clone(),
        };
        (link, MockPeer { record })
    }

    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = Some(mtu);
        self
    }

    pub fn refusing_connect(mut self, reason: impl Into<String>) -> Self {
        self.connect_error = Some(reason.into());
        self
    }

    /// Fail the next `count` characteristic writes.
    pub fn failing_writes(mut self, count: usize) -> Self {
        self.failing_writes = count;
        self
    }
}

impl BleLink for MockLink {
    async fn connect(&mut self, address: &str) -> BridgeResult<()> {
        self.state.check_connect()?;
        lock(&self.record).connects.push(address.to_string());
        if let Some(reason) = &self.connect_error {
            self.state = LinkState::Failed;
            return Err(BridgeError::Connect(reason.clone()));
        }
        self.state = LinkState::Connected;
        Ok(())
    }

    async fn subscribe(&mut self) -> BridgeResult<Notifications> {
        if self.state != LinkState::Connected {
            return Err(BridgeError::Connect(format!("cannot subscribe, link is {}", self.state)));
        }
        let (tx, rx) = mpsc::channel(16);
        lock(&self.record).notify_tx = Some(tx);
        Ok(rx)
    }

    async fn write_characteristic(&mut self, chunk: &[u8]) -> BridgeResult<()> {
        let mut record = lock(&self.record);
        record.write_attempts += 1;
        if self.state != LinkState::Connected {
            return Err(BridgeError::Write("not connected".into()));
        }
        if self.failing_writes > 0 {
            self.failing_writes -= 1;
            return Err(BridgeError::Write("write buffer overrun".into()));
        }
        record.writes.push(chunk.to_vec());
        record.write_times.push(Instant::now());
        Ok(())
    }

    async fn disconnect(&mut self) -> BridgeResult<()> {
        let mut record = lock(&self.record);
        record.disconnects += 1;
        record.notify_tx = None;
        if self.state == LinkState::Connected {
            self.state = LinkState::Disconnected;
        }
        Ok(())
    }

    fn mtu(&self) -> Option<usize> {
        self.mtu
    }

    fn state(&self) -> LinkState {
        self.state
    }
}

impl MockPeer {
    /// Emit a notification frame. Returns false once the link is gone.
    pub async fn notify(&self, frame: &[u8]) -> bool {
        let tx = lock(&self.record).notify_tx.clone();
        match tx {
            Some(tx) => tx.send(frame.to_vec()).await.is_ok(),
            None => false,
        }
    }

    /// Simulate the peripheral going out of range.
    pub fn drop_connection(&self) {
        lock(&self.record).notify_tx = None;
    }

    /// Chunks the peripheral accepted, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.record).writes.clone()
    }

    /// When each accepted chunk arrived, on the tokio clock.
    pub fn write_times(&self) -> Vec<Instant> {
        lock(&self.record).write_times.clone()
    }

    pub fn write_attempts(&self) -> usize {
        lock(&self.record).write_attempts
    }

    pub fn connects(&self) -> Vec<String> {
        lock(&self.record).connects.clone()
    }

    pub fn disconnects(&self) -> usize {
        lock(&self.record).disconnects
    }
}

/// Hands out [`MockPort`]s wired to a single [`MockTerminal`].
pub struct MockPtyAllocator {
    opens: AtomicUsize,
    error: Option<String>,
    parts: Mutex<Option<(MockReader, Box<dyn Write + Send>)>>,
}

/// The serial client's side of a mock PTY.
#[derive(Clone)]
pub struct MockTerminal {
    input: Arc<Mutex<Option<std_mpsc::Sender<Vec<u8>>>>>,
    output: SharedBuffer,
}

impl MockPtyAllocator {
    pub fn new() -> (Self, MockTerminal) {
        let (tx, rx) = std_mpsc::channel();
        let output = SharedBuffer::default();
        let allocator = Self {
            opens: AtomicUsize::new(0),
            error: None,
            parts: Mutex::new(Some((
                MockReader {
                    rx,
                    pending: Vec::new(),
                },
                Box::new(output.clone()) as Box<dyn Write + Send>,
            ))),
        };
        let terminal = MockTerminal {
            input: Arc::new(Mutex::new(Some(tx))),
            output,
        };
        (allocator, terminal)
    }

    pub fn exhausted(mut self, reason: impl Into<String>) -> Self {
        self.error = Some(reason.into());
        self
    }

    /// Make every write to the master fail, as if the slave device broke.
    pub fn failing_writer(self) -> Self {
        if let Some((_, writer)) = lock(&self.parts).as_mut() {
            *writer = Box::new(BrokenWriter);
        }
        self
    }

    /// Number of `open` calls, failed ones included.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl PtyAllocator for MockPtyAllocator {
    fn open(&self) -> BridgeResult<Box<dyn PtyPort>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = &self.error {
            return Err(BridgeError::Allocation(reason.clone()));
        }
        let (reader, writer) = lock(&self.parts)
            .take()
            .ok_or_else(|| BridgeError::Allocation("mock pty already handed out".into()))?;
        Ok(Box::new(MockPort {
            path: PathBuf::from("/dev/pts/mock"),
            reader: Some(reader),
            writer: Some(writer),
        }))
    }
}

impl MockTerminal {
    /// Write bytes into the slave, as a serial client would.
    pub fn type_in(&self, bytes: &[u8]) {
        if let Some(tx) = lock(&self.input).as_ref() {
            let _ = tx.send(bytes.to_vec());
        }
    }

    /// Close the slave; the master then reads end-of-file.
    pub fn hang_up(&self) {
        lock(&self.input).take();
    }

    /// Everything written to the master so far.
    pub fn output(&self) -> Vec<u8> {
        self.output.contents()
    }

    /// Poll until at least `len` bytes were written or `timeout` passes.
    pub async fn wait_for_output(&self, len: usize, timeout: Duration) -> Vec<u8> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let out = self.output();
            if out.len() >= len || tokio::time::Instant::now() >= deadline {
                return out;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

struct MockPort {
    path: PathBuf,
    reader: Option<MockReader>,
    writer: Option<Box<dyn Write + Send>>,
}

impl PtyPort for MockPort {
    fn slave_path(&self) -> &Path {
        &self.path
    }

    fn take_reader(&mut self) -> BridgeResult<Box<dyn Read + Send>> {
        self.reader
            .take()
            .map(|r| Box::new(r) as Box<dyn Read + Send>)
            .ok_or_else(|| BridgeError::Other("reader already taken".into()))
    }

    fn take_writer(&mut self) -> BridgeResult<Box<dyn Write + Send>> {
        self.writer
            .take()
            .ok_or_else(|| BridgeError::Other("writer already taken".into()))
    }
}

struct MockReader {
    rx: std_mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(bytes) => self.pending = bytes,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct BrokenWriter;

impl Write for BrokenWriter {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "slave device went away",
        ))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    fn contents(&self) -> Vec<u8> {
        lock(&self.0).clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        lock(&self.0).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
