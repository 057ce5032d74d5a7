//! Pseudo-terminal endpoint.
//!
//! A [`PtyAllocator`] hands out a [`PtyPort`]: the slave path plus blocking
//! reader/writer halves of the master. [`PtyMaster::attach`] moves each half
//! onto its own OS thread and bridges it to the async engine with bounded
//! channels, so a full PTY buffer blocks the sender instead of losing bytes.

use crate::error::{BridgeError, BridgeResult};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// An allocated master/slave pair.
pub trait PtyPort: Send {
    /// Device path of the slave side, e.g. `/dev/pts/3`.
    fn slave_path(&self) -> &Path;

    /// Take the master's read half. Only the first call succeeds.
    fn take_reader(&mut self) -> BridgeResult<Box<dyn Read + Send>>;

    /// Take the master's write half. Only the first call succeeds.
    fn take_writer(&mut self) -> BridgeResult<Box<dyn Write + Send>>;
}

/// Source of pseudo-terminals.
pub trait PtyAllocator {
    /// Allocate a new pair. Fails with [`BridgeError::Allocation`].
    fn open(&self) -> BridgeResult<Box<dyn PtyPort>>;
}

/// What the reader side of the master observed.
#[derive(Debug)]
pub enum PtyEvent {
    /// Bytes a client wrote into the slave.
    Data(Vec<u8>),
    /// The slave side closed.
    Eof,
    /// Reading or writing the master failed.
    Failed(std::io::Error),
}

/// Master side of a PTY, driven by the `pty-reader` and `pty-writer` threads.
pub struct PtyMaster {
    slave_path: PathBuf,
    events: mpsc::Receiver<PtyEvent>,
    input: mpsc::Sender<Vec<u8>>,
    port: Box<dyn PtyPort>,
}

impl PtyMaster {
    /// Start the I/O threads for `port`.
    ///
    /// `read_buffer` bounds a single read from the master; `capacity` bounds
    /// both channels.
    pub fn attach(
        mut port: Box<dyn PtyPort>,
        read_buffer: usize,
        capacity: usize,
    ) -> BridgeResult<Self> {
        let reader = port.take_reader()?;
        let writer = port.take_writer()?;
        let slave_path = port.slave_path().to_path_buf();

        let (event_tx, events) = mpsc::channel(capacity);
        let (input, input_rx) = mpsc::channel(capacity);

        spawn_reader(reader, read_buffer.max(1), event_tx.clone())?;
        spawn_writer(writer, input_rx, event_tx)?;

        debug!(path = %slave_path.display(), read_buffer, "pty attached");
        Ok(Self {
            slave_path,
            events,
            input,
            port,
        })
    }

    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Split into the event receiver, the input sender and the port itself.
    ///
    /// The port must outlive the relay: it owns the slave descriptor that keeps
    /// the master from reporting end-of-file before a client attaches.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Receiver<PtyEvent>,
        mpsc::Sender<Vec<u8>>,
        Box<dyn PtyPort>,
    ) {
        (self.events, self.input, self.port)
    }
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    read_buffer: usize,
    events: mpsc::Sender<PtyEvent>,
) -> BridgeResult<()> {
    std::thread::Builder::new()
        .name("pty-reader".into())
        .spawn(move || {
            let mut buf = vec![0u8; read_buffer];
            loop {
                let event = match reader.read(&mut buf) {
                    Ok(0) => PtyEvent::Eof,
                    Ok(n) => PtyEvent::Data(buf[..n].to_vec()),
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => PtyEvent::Failed(e),
                };
                let last = !matches!(event, PtyEvent::Data(_));
                if events.blocking_send(event).is_err() || last {
                    break;
                }
            }
            debug!("pty reader finished");
        })
        .map(|_| ())
        .map_err(|e| BridgeError::Allocation(format!("failed to start pty reader: {e}")))
}

fn spawn_writer(
    mut writer: Box<dyn Write + Send>,
    mut input: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<PtyEvent>,
) -> BridgeResult<()> {
    std::thread::Builder::new()
        .name("pty-writer".into())
        .spawn(move || {
            while let Some(frame) = input.blocking_recv() {
                if let Err(e) = writer.write_all(&frame).and_then(|_| writer.flush()) {
                    warn!(error = %e, "pty write failed");
                    if events.blocking_send(PtyEvent::Failed(e)).is_err() {
                        debug!("pty write failure not reported, relay already gone");
                    }
                    break;
                }
            }
            debug!("pty writer finished");
        })
        .map(|_| ())
        .map_err(|e| BridgeError::Allocation(format!("failed to start pty writer: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPtyAllocator;
    use std::time::Duration;

    #[tokio::test]
    async fn reader_reports_data_then_eof() {
        let (allocator, terminal) = MockPtyAllocator::new();
        let port = allocator.open().unwrap();
        let master = PtyMaster::attach(port, 64, 8).unwrap();
        assert_eq!(master.slave_path(), Path::new("/dev/pts/mock"));

        let (mut events, _input, _port) = master.into_parts();
        terminal.type_in(b"AT\r\n");
        terminal.hang_up();

        match events.recv().await {
            Some(PtyEvent::Data(d)) => assert_eq!(d, b"AT\r\n"),
            other => panic!("expected data, got {other:?}"),
        }
        assert!(matches!(events.recv().await, Some(PtyEvent::Eof)));
    }

    #[tokio::test]
    async fn writer_delivers_frames_in_order() {
        let (allocator, terminal) = MockPtyAllocator::new();
        let master = PtyMaster::attach(allocator.open().unwrap(), 64, 8).unwrap();
        let (_events, input, _port) = master.into_parts();

        input.send(b"OK".to_vec()).await.unwrap();
        input.send(b"\r\n".to_vec()).await.unwrap();

        let written = terminal.wait_for_output(4, Duration::from_secs(2)).await;
        assert_eq!(written, b"OK\r\n");
    }

    #[tokio::test]
    async fn writer_failure_surfaces_as_event() {
        let (allocator, _terminal) = MockPtyAllocator::new();
        let allocator = allocator.failing_writer();
        let master = PtyMaster::attach(allocator.open().unwrap(), 64, 8).unwrap();
        let (mut events, input, _port) = master.into_parts();

        input.send(b"AT".to_vec()).await.unwrap();
        match events.recv().await {
            Some(PtyEvent::Failed(e)) => assert_eq!(e.kind(), ErrorKind::BrokenPipe),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn writer_failure_after_relay_exit_is_tolerated() {
        let (allocator, _terminal) = MockPtyAllocator::new();
        let allocator = allocator.failing_writer();
        let master = PtyMaster::attach(allocator.open().unwrap(), 64, 8).unwrap();
        let (events, input, _port) = master.into_parts();
        drop(events);

        input.send(b"AT".to_vec()).await.unwrap();
        // The writer thread exits after its failed write; the channel closes.
        tokio::time::timeout(Duration::from_secs(2), input.closed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn small_read_buffer_splits_reads() {
        let (allocator, terminal) = MockPtyAllocator::new();
        let master = PtyMaster::attach(allocator.open().unwrap(), 3, 8).unwrap();
        let (mut events, _input, _port) = master.into_parts();

        terminal.type_in(b"abcdefg");
        let mut seen = Vec::new();
        while seen.len() < 7 {
            match events.recv().await {
                Some(PtyEvent::Data(d)) => {
                    assert!(d.len() <= 3);
                    seen.extend(d);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen, b"abcdefg");
    }
}
