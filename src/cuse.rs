// CUSE RPMB character-device backend
//
// Copyright 2023 Linaro Ltd. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! CUSE session: the synthetic character device the host tool talks to.
//!
//! CUSE reuses the FUSE wire protocol over `/dev/cuse`. After an init
//! handshake naming the device, the kernel streams requests (open, ioctl,
//! release, ...) down the channel and we write framed replies back. Ioctl
//! arguments arrive truncated to the size encoded in the ioctl number, which
//! for `MMC_IOC_MULTI_CMD` is just the 8-byte header, so the real command
//! chain and all data payloads are pulled straight out of the calling
//! process with `process_vm_readv`/`process_vm_writev`.

use std::{
    fs::File,
    io::{ErrorKind, Read, Write},
    mem::size_of,
};

use log::*;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::{
    mmc::{self, CallerMemory},
    Result, RpmbBackend, RpmbError,
};

const CUSE_CTL_PATH: &str = "/dev/cuse";

const FUSE_MAJOR: u32 = 7;
const FUSE_MINOR: u32 = 31;

/// Largest request/reply body we advertise to the kernel.
const MAX_TRANSFER: usize = 1 << 20;

const CUSE_INIT: u32 = 4096;
const FUSE_OPEN: u32 = 14;
const FUSE_READ: u32 = 15;
const FUSE_WRITE: u32 = 16;
const FUSE_RELEASE: u32 = 18;
const FUSE_FLUSH: u32 = 25;
const FUSE_INTERRUPT: u32 = 36;
const FUSE_DESTROY: u32 = 38;
const FUSE_IOCTL: u32 = 39;

/// Ask the kernel to pass ioctls through without transfer-size policing.
const CUSE_UNRESTRICTED_IOCTL: u32 = 1 << 0;

#[repr(C)]
#[derive(Debug, Copy, Clone, AsBytes, FromBytes, FromZeroes)]
struct FuseInHeader {
    len: u32,
    opcode: u32,
    unique: u64,
    nodeid: u64,
    uid: u32,
    gid: u32,
    pid: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, AsBytes, FromBytes, FromZeroes)]
struct FuseOutHeader {
    len: u32,
    error: i32,
    unique: u64,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, AsBytes, FromBytes, FromZeroes)]
struct CuseInitIn {
    major: u32,
    minor: u32,
    unused: u32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, AsBytes, FromBytes, FromZeroes)]
struct CuseInitOut {
    major: u32,
    minor: u32,
    unused: u32,
    flags: u32,
    max_read: u32,
    max_write: u32,
    dev_major: u32,
    dev_minor: u32,
    spare: [u32; 10],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, AsBytes, FromBytes, FromZeroes)]
struct FuseOpenOut {
    fh: u64,
    open_flags: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, AsBytes, FromBytes, FromZeroes)]
struct FuseIoctlIn {
    fh: u64,
    flags: u32,
    cmd: u32,
    arg: u64,
    in_size: u32,
    out_size: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, AsBytes, FromBytes, FromZeroes)]
struct FuseIoctlOut {
    result: i32,
    flags: u32,
    in_iovs: u32,
    out_iovs: u32,
}

fn encode_reply(unique: u64, error: i32, payload: &[u8]) -> Vec<u8> {
    let mut header = FuseOutHeader::new_zeroed();
    header.len = (size_of::<FuseOutHeader>() + payload.len()) as u32;
    header.error = error;
    header.unique = unique;

    let mut msg = header.as_bytes().to_vec();
    msg.extend_from_slice(payload);
    msg
}

/// The address space of the process issuing the ioctl.
pub struct ProcessMemory {
    pid: u32,
}

impl ProcessMemory {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

impl CallerMemory for ProcessMemory {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let local = libc::iovec {
            iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // SAFETY: the local iovec points at a live, exclusively borrowed
        // buffer; the kernel validates the remote range.
        let n = unsafe {
            libc::process_vm_readv(self.pid as libc::pid_t, &local, 1, &remote, 1, 0)
        };
        if n == buf.len() as isize {
            Ok(())
        } else {
            Err(RpmbError::CallerMemoryRead {
                pid: self.pid,
                addr,
                len: buf.len(),
            })
        }
    }

    fn write_bytes(&self, addr: u64, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let local = libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as *mut libc::c_void,
            iov_len: buf.len(),
        };
        // SAFETY: the local iovec points at a live borrowed buffer which
        // process_vm_writev only reads from.
        let n = unsafe {
            libc::process_vm_writev(self.pid as libc::pid_t, &local, 1, &remote, 1, 0)
        };
        if n == buf.len() as isize {
            Ok(())
        } else {
            Err(RpmbError::CallerMemoryWrite {
                pid: self.pid,
                addr,
                len: buf.len(),
            })
        }
    }
}

/// One CUSE session. Requests are served synchronously in arrival order;
/// exactly one transport transaction touches the engine at a time.
pub struct CuseDevice {
    channel: File,
    dev_name: String,
}

impl CuseDevice {
    pub fn create(dev_name: &str) -> Result<Self> {
        let channel = File::options()
            .read(true)
            .write(true)
            .open(CUSE_CTL_PATH)
            .map_err(RpmbError::CuseOpen)?;
        Ok(Self {
            channel,
            dev_name: dev_name.to_owned(),
        })
    }

    /// Serve the session until the kernel destroys it or unregisters the
    /// device.
    pub fn run(&mut self, backend: &mut RpmbBackend) -> Result<()> {
        let mut buf = vec![0_u8; size_of::<FuseInHeader>() + MAX_TRANSFER];
        loop {
            let n = match self.channel.read(&mut buf) {
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.raw_os_error() == Some(libc::ENODEV) => {
                    info!("device unregistered, shutting down");
                    return Ok(());
                }
                Err(err) => return Err(RpmbError::CuseChannel(err)),
            };
            let Some(header) = FuseInHeader::read_from_prefix(&buf[..n]) else {
                return Err(RpmbError::TruncatedRequest(n));
            };
            let body = &buf[size_of::<FuseInHeader>()..n];

            match header.opcode {
                CUSE_INIT => self.init(&header, body)?,
                FUSE_OPEN => {
                    debug!("open()");
                    self.reply(header.unique, 0, FuseOpenOut::new_zeroed().as_bytes());
                }
                FUSE_IOCTL => self.ioctl(backend, &header, body),
                FUSE_READ | FUSE_WRITE => {
                    debug!("read()/write() on the device node is not supported");
                    self.reply_err(header.unique, libc::EOPNOTSUPP);
                }
                FUSE_FLUSH | FUSE_RELEASE => self.reply(header.unique, 0, &[]),
                FUSE_INTERRUPT => debug!("interrupt ignored"),
                FUSE_DESTROY => {
                    info!("session destroyed by the kernel");
                    return Ok(());
                }
                other => {
                    debug!("unhandled opcode {other}");
                    self.reply_err(header.unique, libc::ENOSYS);
                }
            }
        }
    }

    fn init(&mut self, header: &FuseInHeader, body: &[u8]) -> Result<()> {
        let Some(init) = CuseInitIn::read_from_prefix(body) else {
            return Err(RpmbError::TruncatedRequest(body.len()));
        };
        if init.major != FUSE_MAJOR {
            self.reply_err(header.unique, libc::EPROTO);
            return Err(RpmbError::AbiMismatch(init.major, init.minor));
        }
        debug!("kernel speaks FUSE ABI {}.{}", init.major, init.minor);

        let mut out = CuseInitOut::new_zeroed();
        out.major = FUSE_MAJOR;
        out.minor = FUSE_MINOR;
        out.flags = CUSE_UNRESTRICTED_IOCTL;
        out.max_read = MAX_TRANSFER as u32;
        out.max_write = MAX_TRANSFER as u32;

        let mut payload = out.as_bytes().to_vec();
        payload.extend_from_slice(format!("DEVNAME={}", self.dev_name).as_bytes());
        payload.push(0);
        self.reply(header.unique, 0, &payload);

        info!("registered /dev/{}", self.dev_name);
        Ok(())
    }

    fn ioctl(&mut self, backend: &mut RpmbBackend, header: &FuseInHeader, body: &[u8]) {
        let Some(ioctl) = FuseIoctlIn::read_from_prefix(body) else {
            self.reply_err(header.unique, libc::EINVAL);
            return;
        };
        debug!(
            "ioctl {:#010x} from pid {} (arg {:#x}, in {}, out {})",
            ioctl.cmd, header.pid, ioctl.arg, ioctl.in_size, ioctl.out_size
        );

        // The in_buf copy is truncated to the ioctl's encoded size, so it is
        // ignored; everything is read from the caller instead.
        if ioctl.cmd != mmc::MMC_IOC_MULTI_CMD {
            let err = RpmbError::UnsupportedIoctl(ioctl.cmd);
            debug!("{err}");
            self.reply_err(header.unique, err.errno());
            return;
        }

        let caller = ProcessMemory::new(header.pid);
        match mmc::handle_multi_cmd(backend, &caller, ioctl.arg) {
            Ok(()) => self.reply(header.unique, 0, FuseIoctlOut::new_zeroed().as_bytes()),
            Err(err) => {
                warn!("ioctl failed: {err}");
                self.reply_err(header.unique, err.errno());
            }
        }
    }

    fn reply(&mut self, unique: u64, error: i32, payload: &[u8]) {
        let msg = encode_reply(unique, error, payload);
        if let Err(err) = self.channel.write_all(&msg) {
            warn!("cannot send reply for request {unique}: {err}");
        }
    }

    fn reply_err(&mut self, unique: u64, errno: i32) {
        self.reply(unique, -errno, &[]);
    }
}
