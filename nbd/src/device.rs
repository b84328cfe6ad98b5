//! Linux kernel NBD device control.
//!
//! Attaching a negotiated session to `/dev/nbdX` is a fixed ioctl sequence
//! followed by `NBD_DO_IT`, which blocks the calling thread for as long as
//! the kernel keeps the session alive. Callers run [`KernelDevice::run`] on
//! a thread of their own.
//!
//! ```ignore
//! let mut device = KernelDevice::open("/dev/nbd0")?;
//! device.attach(socket, &session)?;
//! rescan_partitions(device.path().to_path_buf());
//! device.run()?;
//! ```

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use nix::libc;

use crate::protocol::Session;

// From linux/nbd.h and linux/fs.h
mod ioctl {
    use nix::libc;
    pub const NBD_SET_SOCK: libc::c_ulong = 0xab00;
    pub const NBD_SET_BLKSIZE: libc::c_ulong = 0xab01;
    pub const NBD_DO_IT: libc::c_ulong = 0xab03;
    pub const NBD_CLEAR_SOCK: libc::c_ulong = 0xab04;
    pub const NBD_CLEAR_QUE: libc::c_ulong = 0xab05;
    pub const NBD_SET_SIZE_BLOCKS: libc::c_ulong = 0xab07;
    pub const NBD_DISCONNECT: libc::c_ulong = 0xab08;
    pub const NBD_SET_FLAGS: libc::c_ulong = 0xab0a;
    pub const BLKROSET: libc::c_ulong = 0x125d;
}
use ioctl::*;

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// An open kernel NBD device node.
pub struct KernelDevice {
    path: PathBuf,
    file: File,
    /// Held until the device is cleared so the kernel's socket stays valid.
    socket: Option<OwnedFd>,
}

impl KernelDevice {
    /// Open the device node read/write.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self {
            path,
            file,
            socket: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hand a connected, negotiated socket to the kernel.
    pub fn attach(&mut self, socket: OwnedFd, session: &Session) -> io::Result<()> {
        let fd = self.file.as_raw_fd();
        let block_size = session.device_block_size() as libc::c_ulong;
        let blocks = (session.size_bytes / block_size as u64) as libc::c_ulong;

        unsafe {
            // Stale state from a previous user; failure just means none.
            libc::ioctl(fd, NBD_CLEAR_SOCK);

            check(libc::ioctl(fd, NBD_SET_BLKSIZE, block_size))?;
            check(libc::ioctl(fd, NBD_SET_SIZE_BLOCKS, blocks))?;

            if session.is_read_only() {
                let read_only: libc::c_int = 1;
                check(libc::ioctl(fd, BLKROSET, &read_only as *const libc::c_int))?;
            }

            // Older kernels lack NBD_SET_FLAGS.
            match check(libc::ioctl(
                fd,
                NBD_SET_FLAGS,
                session.transmission_flags as libc::c_ulong,
            )) {
                Err(e) if e.raw_os_error() != Some(libc::ENOTTY) => return Err(e),
                _ => {}
            }

            check(libc::ioctl(fd, NBD_SET_SOCK, socket.as_raw_fd()))?;
        }

        self.socket = Some(socket);
        Ok(())
    }

    /// Serve kernel I/O over the attached socket until the session ends.
    ///
    /// Blocks the calling thread. The queue and socket are cleared on
    /// return regardless of outcome.
    pub fn run(&mut self) -> io::Result<()> {
        let fd = self.file.as_raw_fd();
        let result = unsafe { check(libc::ioctl(fd, NBD_DO_IT)) };
        self.clear();

        match result {
            Err(e) if matches!(e.raw_os_error(), Some(libc::EPIPE) | Some(libc::ENOTCONN)) => Ok(()),
            other => other,
        }
    }

    fn clear(&mut self) {
        let fd = self.file.as_raw_fd();
        unsafe {
            libc::ioctl(fd, NBD_CLEAR_QUE);
            libc::ioctl(fd, NBD_CLEAR_SOCK);
        }
        self.socket = None;
    }
}

/// Ask the kernel to reread the partition table of `path`.
///
/// Linux rescans on open when the module was loaded with `max_part > 0`.
/// Runs detached; the outcome is not reported.
pub fn rescan_partitions(path: PathBuf) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("nbd-rescan".into())
        .spawn(move || {
            let _ = OpenOptions::new().read(true).write(true).open(&path);
        })
}

/// Disconnect an NBD device by path.
///
/// Same sequence as `nbd-client -d`: `NBD_DISCONNECT` makes the kernel send
/// `NBD_CMD_DISC`, `NBD_CLEAR_SOCK` drops the socket and pending requests.
pub fn disconnect_device(path: impl AsRef<Path>) -> io::Result<()> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let fd = file.as_raw_fd();

    unsafe {
        check(libc::ioctl(fd, NBD_DISCONNECT))?;
        libc::ioctl(fd, NBD_CLEAR_SOCK);
    }
    Ok(())
}
