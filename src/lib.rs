// CUSE RPMB character-device backend
//
// Copyright 2023 Linaro Ltd. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

#![deny(
    /* groups */
    clippy::correctness,
    clippy::suspicious,
    clippy::complexity,
    clippy::perf,
    clippy::style,
    //* restriction */
    clippy::dbg_macro,
    clippy::rc_buffer,
    clippy::as_underscore,
    clippy::assertions_on_result_states,
    //* pedantic */
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    clippy::ptr_as_ptr,
    clippy::bool_to_int_with_if,
    clippy::borrow_as_ptr,
    clippy::case_sensitive_file_extension_comparisons,
    clippy::cast_ptr_alignment,
    clippy::naive_bytecount
)]

use std::{
    collections::VecDeque,
    io::Error as IoError,
    path::{Path, PathBuf},
};

use clap::Parser;
use log::*;
use thiserror::Error as ThisError;
use zerocopy::{AsBytes, FromBytes};

pub mod cuse;
pub mod io;
pub mod mmc;
mod state;

use self::io::*;

pub type Result<T> = std::result::Result<T, RpmbError>;

/// Errors related to the cuse-device-rpmb daemon.
///
/// Protocol failures are not errors: they travel back to the host as result
/// codes inside well-formed response frames. This type covers transport and
/// configuration failures only.
#[derive(Debug, ThisError)]
pub enum RpmbError {
    #[error("key already programmed")]
    KeyAlreadySet,
    #[error("key not programmed")]
    KeyNotSet,
    #[error("unknown frame type {0:#06x}")]
    UnknownFrameType(u16),
    #[error("suspicious command count {0} in multi-command block")]
    InvalidCommandCount(u64),
    #[error("unsupported MMC opcode {0}")]
    UnsupportedOpcode(u32),
    #[error("MMC opcode {0} carries no data payload")]
    MissingPayload(u32),
    #[error("unsupported ioctl {0:#010x}")]
    UnsupportedIoctl(u32),
    #[error("cannot read {len} bytes at {addr:#x} from caller pid {pid}")]
    CallerMemoryRead { pid: u32, addr: u64, len: usize },
    #[error("cannot write {len} bytes at {addr:#x} to caller pid {pid}")]
    CallerMemoryWrite { pid: u32, addr: u64, len: usize },
    #[error("cannot open the CUSE control device: {0}")]
    CuseOpen(IoError),
    #[error("CUSE channel failed: {0}")]
    CuseChannel(IoError),
    #[error("truncated CUSE request of {0} bytes")]
    TruncatedRequest(usize),
    #[error("kernel offers FUSE ABI {0}.{1}, need major 7")]
    AbiMismatch(u32, u32),
    #[error("state file path {} is not absolute", .0.display())]
    StatePathNotAbsolute(PathBuf),
    #[error("directory for state file {} does not exist", .0.display())]
    StateDirMissing(PathBuf),
}

impl RpmbError {
    /// The errno an ioctl caller sees when this failure aborts a transport
    /// transaction.
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidCommandCount(_) => libc::EINVAL,
            Self::UnsupportedIoctl(_) => libc::ENOTTY,
            _ => libc::EIO,
        }
    }
}

#[derive(Clone, Parser, Debug, PartialEq, Eq)]
#[clap(author, version, about, long_about = None)]
pub struct RpmbArgs {
    /// Absolute path to the state file holding key, write counter and data.
    #[clap(short = 's', long)]
    pub state_file: PathBuf,
    /// Name of the character device registered under /dev.
    #[clap(short = 'd', long, default_value = "mmcblk2rpmb")]
    pub dev: String,
    /// Size of the emulated data area in 256-byte blocks.
    #[clap(long, default_value_t = 128, value_parser = clap::value_parser!(u32).range(1..=65536))]
    pub max_blocks: u32,
    /// Let PROGRAM_KEY replace an existing key instead of failing. Real
    /// hardware burns the key once; this is for test setups.
    #[clap(long)]
    pub allow_rekey: bool,
    /// Enable debug output.
    #[clap(long)]
    pub debug: bool,
    /// Disable all output.
    #[clap(long, conflicts_with = "debug")]
    pub quiet: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RpmbConfig {
    /// Where key, write counter and block data persist between runs.
    pub state_file: PathBuf,
    /// Device node name under /dev.
    pub dev_name: String,
    /// Data area size in 256-byte blocks.
    pub max_blocks: u32,
    /// Whether PROGRAM_KEY may replace an existing key.
    pub allow_rekey: bool,
}

impl TryFrom<RpmbArgs> for RpmbConfig {
    type Error = RpmbError;

    fn try_from(args: RpmbArgs) -> Result<Self> {
        if !args.state_file.is_absolute() {
            return Err(RpmbError::StatePathNotAbsolute(args.state_file));
        }
        if !args.state_file.parent().map_or(false, Path::is_dir) {
            return Err(RpmbError::StateDirMissing(args.state_file));
        }
        Ok(Self {
            state_file: args.state_file,
            dev_name: args.dev,
            max_blocks: args.max_blocks,
            allow_rekey: args.allow_rekey,
        })
    }
}

/// A DATA_READ whose response cannot be built yet: the authoritative block
/// count only arrives with the transport's read sub-command.
struct PendingRead {
    addr: u16,
    nonce: Nonce,
}

/// The RPMB protocol engine. Single-threaded and non-reentrant: the
/// transport serializes request batches, and every buffer handed in is
/// borrowed only for the duration of the call.
pub struct RpmbBackend {
    config: RpmbConfig,
    key: Key,
    write_counter: u32,
    storage: Vec<u8>,
    resp_queue: VecDeque<Frame>,
    pending_read: Option<PendingRead>,
}

impl RpmbBackend {
    /// Create an engine over `config`, picking up any state persisted by a
    /// previous run. An unreadable or foreign state file means a fresh
    /// device.
    pub fn new(config: &RpmbConfig) -> Self {
        let mut ret = Self {
            key: Key::new(),
            write_counter: 0,
            storage: vec![0; config.max_blocks as usize * RPMB_BLOCK_SIZE],
            resp_queue: VecDeque::new(),
            pending_read: None,
            config: config.clone(),
        };
        ret.load_state();
        ret
    }

    /// Accept one batch of request frames from the transport (the payload
    /// of a "write multiple blocks" sub-command).
    ///
    /// A buffer whose first frame is DATA_WRITE is a single multi-frame
    /// request; anything else dispatches frame by frame.
    pub fn write_request_frames(&mut self, data: &[u8]) {
        if data.is_empty() || data.len() % RPMB_FRAME_SIZE != 0 {
            warn!(
                "dropping request of {} bytes (not a whole number of frames)",
                data.len()
            );
            return;
        }
        let Some(frames) = Frame::slice_from(data) else {
            warn!("dropping misaligned request buffer");
            return;
        };

        if frames[0].req_resp.get() == RpmbRequestKind::DataWrite as u16 {
            self.process_request(frames);
        } else {
            for frame in frames {
                self.process_request(std::slice::from_ref(frame));
            }
        }
    }

    /// Hand out the front `out.len()` bytes of queued response frames. An
    /// underrun zeroes the whole buffer; RPMB hosts expect exact lengths.
    pub fn read_response_frames(&mut self, out: &mut [u8]) {
        let available = self.resp_queue.len() * RPMB_FRAME_SIZE;
        if out.len() % RPMB_FRAME_SIZE != 0 || available < out.len() {
            warn!(
                "response underrun: caller wants {} bytes, {} queued",
                out.len(),
                available
            );
            out.fill(0);
            return;
        }
        for chunk in out.chunks_exact_mut(RPMB_FRAME_SIZE) {
            if let Some(frame) = self.resp_queue.pop_front() {
                chunk.copy_from_slice(frame.as_bytes());
            }
        }
    }

    /// True while a DATA_READ request is latched waiting for its block
    /// count.
    pub fn has_pending_read(&self) -> bool {
        self.pending_read.is_some()
    }

    /// Build the response batch for a latched DATA_READ, now that the
    /// transport has revealed the block count. No-op when nothing is
    /// pending; a count of zero reads as one.
    pub fn finalize_pending_read(&mut self, blk_cnt: u16) {
        let Some(PendingRead { addr, nonce }) = self.pending_read.take() else {
            return;
        };
        let blk_cnt = blk_cnt.max(1);
        self.resp_queue.clear();

        if !self.key.is_programmed() {
            debug!("data read: no key programmed");
            self.push_read_status(RpmbOpResult::NoAuthKey, addr, blk_cnt, nonce);
            return;
        }
        if !self.addr_valid(addr, blk_cnt) {
            debug!("data read: {blk_cnt} blocks at {addr} exceed the data area");
            self.push_read_status(RpmbOpResult::AddrFailure, addr, blk_cnt, nonce);
            return;
        }

        let mut frames = Vec::with_capacity(usize::from(blk_cnt));
        for i in 0..blk_cnt {
            let mut frame =
                Frame::response(RpmbResponseKind::DataRead, RpmbOpResult::Ok, self.write_counter);
            frame.data.copy_from_slice(self.block(addr + i));
            frame.nonce = nonce;
            frame.address = (addr + i).into();
            frame.block_count = blk_cnt.into();
            frames.push(frame);
        }

        // Read responses are authenticated as one chain: a single MAC over
        // the concatenated regions, carried by the last frame only.
        if let (Ok(mac), Some(last)) = (self.mac_over(&frames), frames.last_mut()) {
            last.key_mac = mac;
        }
        debug!("data read: {blk_cnt} blocks at {addr}");
        self.resp_queue.extend(frames);
    }

    fn process_request(&mut self, frames: &[Frame]) {
        let first = &frames[0];
        match RpmbRequestKind::try_from(first.req_resp.get()) {
            Ok(RpmbRequestKind::ProgramKey) => {
                self.resp_queue.clear();
                self.program_key(first);
            }
            Ok(RpmbRequestKind::GetWriteCounter) => {
                self.resp_queue.clear();
                self.get_counter(first);
            }
            Ok(RpmbRequestKind::DataWrite) => {
                self.resp_queue.clear();
                self.data_write(frames);
            }
            Ok(RpmbRequestKind::DataRead) => {
                self.resp_queue.clear();
                self.start_pending_read(first);
            }
            Ok(RpmbRequestKind::ResultRead) => self.result_read(),
            Err(_) => {
                debug!("unknown request type {:#06x}", first.req_resp.get());
                self.resp_queue.clear();
                self.push_response(
                    Frame::response(RpmbResponseKind::ResultRead, RpmbOpResult::GeneralFailure, 0),
                    false,
                );
            }
        }
    }

    fn program_key(&mut self, req: &Frame) {
        let allow_rekey = self.config.allow_rekey;
        if self.key.program(req.key_mac, allow_rekey).is_err() {
            debug!("key already programmed");
            self.push_response(
                Frame::response(
                    RpmbResponseKind::ProgramKey,
                    RpmbOpResult::GeneralFailure,
                    self.write_counter,
                ),
                false,
            );
            return;
        }

        info!("authentication key programmed");
        self.save_state();
        self.push_response(
            Frame::response(RpmbResponseKind::ProgramKey, RpmbOpResult::Ok, self.write_counter),
            false,
        );
    }

    fn get_counter(&mut self, req: &Frame) {
        let signed = self.key.is_programmed();
        if !signed {
            debug!("get counter: no key programmed");
        }
        let result = if signed {
            RpmbOpResult::Ok
        } else {
            RpmbOpResult::NoAuthKey
        };
        let mut resp = Frame::response(RpmbResponseKind::GetCounter, result, self.write_counter);
        resp.nonce = req.nonce;
        self.push_response(resp, signed);
    }

    fn data_write(&mut self, frames: &[Frame]) {
        let first = &frames[0];
        let addr = first.address.get();
        let blk_cnt = first.block_count.get();
        let wc_req = first.write_counter.get();

        if !self.key.is_programmed() {
            warn!("data write: no key programmed");
            self.push_write_status(RpmbOpResult::NoAuthKey, addr, blk_cnt);
            return;
        }
        if blk_cnt == 0 || usize::from(blk_cnt) != frames.len() {
            debug!(
                "data write: block count {blk_cnt} does not match {} request frames",
                frames.len()
            );
            self.push_write_status(RpmbOpResult::GeneralFailure, addr, blk_cnt);
            return;
        }
        if !self.addr_valid(addr, blk_cnt) {
            debug!("data write: {blk_cnt} blocks at {addr} exceed the data area");
            self.push_write_status(RpmbOpResult::AddrFailure, addr, blk_cnt);
            return;
        }
        // Each frame authenticates its own region; the host supplies
        // per-frame MACs on the write path.
        if !frames.iter().all(|frame| self.verify_mac(frame)) {
            warn!("data write: frame authentication failed");
            self.push_write_status(RpmbOpResult::AuthFailure, addr, blk_cnt);
            return;
        }
        if wc_req != self.write_counter {
            debug!(
                "data write: stale write counter {wc_req} (current {})",
                self.write_counter
            );
            self.push_write_status(RpmbOpResult::CountFailure, addr, blk_cnt);
            return;
        }

        for (i, frame) in frames.iter().enumerate() {
            self.write_block(addr + i as u16, &frame.data);
        }
        self.write_counter = self.write_counter.wrapping_add(1);
        debug!(
            "data write: {blk_cnt} blocks at {addr}, write counter now {}",
            self.write_counter
        );
        self.save_state();
        self.push_write_status(RpmbOpResult::Ok, addr, blk_cnt);
    }

    /// Latch the request; the response batch is built once the transport's
    /// read sub-command tells us how many frames the host expects.
    fn start_pending_read(&mut self, req: &Frame) {
        let addr = req.address.get();
        debug!("data read latched at {addr}");
        self.pending_read = Some(PendingRead {
            addr,
            nonce: req.nonce,
        });
    }

    fn result_read(&mut self) {
        if self.pending_read.is_some() {
            debug!("result read ignored while a data read is pending");
            return;
        }
        if !self.resp_queue.is_empty() {
            // The queued response is the result the host is asking for.
            return;
        }
        self.push_response(
            Frame::response(RpmbResponseKind::ResultRead, RpmbOpResult::GeneralFailure, 0),
            false,
        );
    }

    fn push_response(&mut self, mut frame: Frame, with_mac: bool) {
        if with_mac {
            if let Ok(mac) = self.mac_over(std::slice::from_ref(&frame)) {
                frame.key_mac = mac;
            }
        }
        self.resp_queue.push_back(frame);
    }

    fn push_write_status(&mut self, result: RpmbOpResult, addr: u16, blk_cnt: u16) {
        let mut resp = Frame::response(RpmbResponseKind::DataWrite, result, self.write_counter);
        resp.address = addr.into();
        resp.block_count = blk_cnt.into();
        self.push_response(resp, false);
    }

    fn push_read_status(&mut self, result: RpmbOpResult, addr: u16, blk_cnt: u16, nonce: Nonce) {
        let mut resp = Frame::response(RpmbResponseKind::DataRead, result, self.write_counter);
        resp.address = addr.into();
        resp.block_count = blk_cnt.into();
        resp.nonce = nonce;
        self.push_response(resp, false);
    }

    fn mac_over(&self, frames: &[Frame]) -> Result<[u8; RPMB_KEY_MAC_SIZE]> {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;
        type HmacSha256 = Hmac<Sha256>;

        let mut mac = HmacSha256::new_from_slice(&self.key.get()?)
            .expect("HMAC can take key of any size");
        for frame in frames {
            mac.update(frame.mac_region());
        }
        Ok(mac.finalize().into_bytes().into())
    }

    fn verify_mac(&self, frame: &Frame) -> bool {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;
        type HmacSha256 = Hmac<Sha256>;

        let Ok(key) = self.key.get() else {
            return false;
        };
        let mut mac =
            HmacSha256::new_from_slice(&key).expect("HMAC can take key of any size");
        mac.update(frame.mac_region());
        mac.verify_slice(&frame.key_mac).is_ok()
    }

    fn addr_valid(&self, addr: u16, count: u16) -> bool {
        count != 0 && u32::from(addr) + u32::from(count) <= self.config.max_blocks
    }

    fn block(&self, addr: u16) -> &[u8] {
        &self.storage[usize::from(addr) * RPMB_BLOCK_SIZE..][..RPMB_BLOCK_SIZE]
    }

    fn write_block(&mut self, addr: u16, data: &[u8; RPMB_BLOCK_SIZE]) {
        self.storage[usize::from(addr) * RPMB_BLOCK_SIZE..][..RPMB_BLOCK_SIZE]
            .copy_from_slice(data);
    }

    fn load_state(&mut self) {
        match state::load(&self.config.state_file) {
            Ok(Some(snap)) => {
                if snap.key_programmed {
                    self.key = Key::new_with(snap.key);
                }
                self.write_counter = snap.write_counter;
                if snap.max_blocks == self.config.max_blocks
                    && snap.storage.len() == self.storage.len()
                {
                    self.storage = snap.storage;
                } else {
                    warn!(
                        "stored geometry ({} blocks) differs from configured ({}), resetting data area",
                        snap.max_blocks, self.config.max_blocks
                    );
                }
                debug!(
                    "state loaded: key_programmed={} write_counter={}",
                    self.key.is_programmed(),
                    self.write_counter
                );
            }
            Ok(None) => debug!(
                "no usable state at {}, starting fresh",
                self.config.state_file.display()
            ),
            Err(err) => warn!(
                "cannot read state file {}: {err}",
                self.config.state_file.display()
            ),
        }
    }

    /// Persistence failures are logged and swallowed: the in-memory
    /// operation already completed and the host has its response.
    fn save_state(&self) {
        let snap = state::Snapshot {
            key_programmed: self.key.is_programmed(),
            key: self.key.get().unwrap_or([0; RPMB_KEY_MAC_SIZE]),
            write_counter: self.write_counter,
            max_blocks: self.config.max_blocks,
            storage: self.storage.clone(),
        };
        if let Err(err) = state::save(&self.config.state_file, &snap) {
            error!(
                "cannot save state to {}: {err}",
                self.config.state_file.display()
            );
        }
    }
}

impl Drop for RpmbBackend {
    fn drop(&mut self) {
        self.save_state();
    }
}

/// Run the daemon: register the character device and serve ioctls until the
/// kernel tears the session down.
pub fn start_device(config: &RpmbConfig) -> Result<()> {
    let mut backend = RpmbBackend::new(config);
    let mut device = cuse::CuseDevice::create(&config.dev_name)?;
    device.run(&mut backend)
}
