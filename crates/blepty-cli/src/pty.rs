//! Native pseudo-terminals via portable-pty.
//!
//! The slave is prepared for serial traffic: raw line discipline with echo
//! off, and a world read/writable device node so an unprivileged client can
//! open it while the bridge runs with raised BLE privileges.

use blepty_core::{BridgeError, BridgeResult, PtyAllocator, PtyPort};
use nix::sys::termios::{
    cfmakeraw, tcgetattr, tcsetattr, LocalFlags, SetArg, SpecialCharacterIndices,
};
use portable_pty::{native_pty_system, MasterPty, PtySize, SlavePty};
use std::io::Read;
use std::os::fd::BorrowedFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Allocates PTYs from the host OS.
#[derive(Debug, Clone)]
pub struct NativePtyAllocator {
    raw_mode: bool,
    world_accessible: bool,
}

impl NativePtyAllocator {
    pub fn new(raw_mode: bool, world_accessible: bool) -> Self {
        Self {
            raw_mode,
            world_accessible,
        }
    }
}

impl PtyAllocator for NativePtyAllocator {
    fn open(&self) -> BridgeResult<Box<dyn PtyPort>> {
        let size = PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = native_pty_system()
            .openpty(size)
            .map_err(|e| BridgeError::Allocation(format!("failed to open PTY: {e}")))?;

        let slave_path = pair
            .master
            .tty_name()
            .ok_or_else(|| BridgeError::Allocation("PTY has no slave device name".into()))?;

        if self.raw_mode {
            make_raw(pair.master.as_ref())?;
        }
        if self.world_accessible {
            let perms = std::fs::Permissions::from_mode(0o666);
            if let Err(e) = std::fs::set_permissions(&slave_path, perms) {
                warn!(path = %slave_path.display(), error = %e, "cannot chmod PTY slave");
            }
        }

        info!(path = %slave_path.display(), raw = self.raw_mode, "PTY allocated");
        Ok(Box::new(NativePort {
            slave_path,
            master: pair.master,
            _slave: pair.slave,
        }))
    }
}

/// Raw mode, no echo, applied through the master descriptor.
fn make_raw(master: &(dyn MasterPty + Send)) -> BridgeResult<()> {
    let raw = master
        .as_raw_fd()
        .ok_or_else(|| BridgeError::Allocation("PTY master has no descriptor".into()))?;
    // SAFETY: `raw` belongs to `master`, which is alive for the whole call.
    let fd = unsafe { BorrowedFd::borrow_raw(raw) };

    let mut attrs = tcgetattr(fd)
        .map_err(|e| BridgeError::Allocation(format!("tcgetattr failed: {e}")))?;
    cfmakeraw(&mut attrs);
    attrs.local_flags.remove(LocalFlags::ECHO);
    // The portable-pty writer emits "\n" + VEOF when dropped; with VEOF
    // disabled the client sees no stray bytes at teardown.
    attrs.control_chars[SpecialCharacterIndices::VEOF as usize] = 0;
    tcsetattr(fd, SetArg::TCSADRAIN, &attrs)
        .map_err(|e| BridgeError::Allocation(format!("tcsetattr failed: {e}")))?;
    debug!("PTY set to raw mode");
    Ok(())
}

/// An open PTY. Holding `_slave` keeps the master from hitting end-of-file
/// before the first client opens the device.
struct NativePort {
    slave_path: PathBuf,
    master: Box<dyn MasterPty + Send>,
    _slave: Box<dyn SlavePty + Send>,
}

impl PtyPort for NativePort {
    fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    fn take_reader(&mut self) -> BridgeResult<Box<dyn Read + Send>> {
        let reader = self
            .master
            .try_clone_reader()
            .map_err(|e| BridgeError::Allocation(format!("failed to clone PTY reader: {e}")))?;
        Ok(Box::new(MasterReader(reader)))
    }

    fn take_writer(&mut self) -> BridgeResult<Box<dyn std::io::Write + Send>> {
        self.master
            .take_writer()
            .map_err(|e| BridgeError::Allocation(format!("failed to take PTY writer: {e}")))
    }
}

/// Reports the `EIO` Linux returns once every slave descriptor is closed as
/// end-of-file.
struct MasterReader(Box<dyn Read + Send>);

impl Read for MasterReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.0.read(buf) {
            Err(e) if e.raw_os_error() == Some(nix::errno::Errno::EIO as i32) => Ok(0),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn eio_reads_as_eof() {
        struct Hangup;
        impl Read for Hangup {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::from_raw_os_error(nix::errno::Errno::EIO as i32))
            }
        }
        let mut reader = MasterReader(Box::new(Hangup));
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn other_errors_pass_through() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("boom"))
            }
        }
        let mut reader = MasterReader(Box::new(Broken));
        let mut buf = [0u8; 8];
        assert!(reader.read(&mut buf).is_err());
    }

    #[test]
    fn allocated_slave_echoes_nothing_back() {
        let allocator = NativePtyAllocator::new(true, false);
        let mut port = match allocator.open() {
            Ok(p) => p,
            // Sandboxed CI runners may have no /dev/ptmx.
            Err(_) => return,
        };
        assert!(port.slave_path().starts_with("/dev"));

        let mut slave = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(port.slave_path())
            .unwrap();
        let mut writer = port.take_writer().unwrap();
        let mut reader = port.take_reader().unwrap();

        writer.write_all(b"\x01\x02\r\n").unwrap();
        let mut buf = [0u8; 4];
        slave.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"\x01\x02\r\n");

        slave.write_all(b"ok").unwrap();
        let mut back = [0u8; 2];
        reader.read_exact(&mut back).unwrap();
        assert_eq!(&back, b"ok");
    }
}
