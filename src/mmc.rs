// CUSE RPMB character-device backend
//
// Copyright 2023 Linaro Ltd. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! MMC multi-command transport adapter.
//!
//! The host tool drives the device with `MMC_IOC_MULTI_CMD`: a header
//! counting the sub-commands, followed by an array of `mmc_ioc_cmd`
//! records. Only the classic RPMB chain is understood: CMD23 (set block
//! count) and CMD12 (stop) are accepted and ignored, CMD25 carries request
//! frames into the engine, CMD18 pulls response frames back out. Payloads
//! live in the calling process and are reached through a [`CallerMemory`]
//! capability, so everything here is testable without a kernel.

use std::mem::size_of;

use data_encoding::HEXLOWER;
use log::*;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::{
    io::{Frame, RPMB_FRAME_SIZE},
    Result, RpmbBackend, RpmbError,
};

/// _IOWR(MMC_BLOCK_MAJOR, 1, struct mmc_ioc_multi_cmd)
pub const MMC_IOC_MULTI_CMD: u32 = 0xC008_B301;

pub const MMC_STOP_TRANSMISSION: u32 = 12;
pub const MMC_READ_MULTIPLE_BLOCK: u32 = 18;
pub const MMC_SET_BLOCK_COUNT: u32 = 23;
pub const MMC_WRITE_MULTIPLE_BLOCK: u32 = 25;

/// Sanity cap on sub-commands per ioctl, not a protocol constant. The RPMB
/// chain needs four.
const MAX_CMDS_PER_IOCTL: u64 = 16;

/// Byte ranges in the calling process's address space. The CUSE layer backs
/// this with process-memory syscalls; tests use a flat buffer.
pub trait CallerMemory {
    fn read_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<()>;
    fn write_bytes(&self, addr: u64, buf: &[u8]) -> Result<()>;
}

/// struct mmc_ioc_cmd from the kernel uAPI, 72 bytes.
#[repr(C)]
#[derive(Debug, Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct MmcIocCmd {
    pub write_flag: i32,
    pub is_acmd: i32,
    pub opcode: u32,
    pub arg: u32,
    pub response: [u32; 4],
    pub flags: u32,
    pub blksz: u32,
    pub blocks: u32,
    pub postsleep_min_us: u32,
    pub postsleep_max_us: u32,
    pub data_timeout_ns: u32,
    pub cmd_timeout_ms: u32,
    pub pad: u32,
    pub data_ptr: u64,
}

/// struct mmc_ioc_multi_cmd header; the command array follows in memory.
#[repr(C)]
#[derive(Debug, Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct MmcIocMultiCmd {
    pub num_of_cmds: u64,
}

impl MmcIocCmd {
    fn data_len(&self) -> usize {
        self.blocks as usize * self.blksz as usize
    }
}

/// Execute one multi-command ioctl whose argument block lives at `arg` in
/// the caller. Failures map to an errno via [`RpmbError::errno`] and leave
/// the engine untouched mid-command.
pub fn handle_multi_cmd<M: CallerMemory>(
    backend: &mut RpmbBackend,
    caller: &M,
    arg: u64,
) -> Result<()> {
    let mut header = MmcIocMultiCmd::new_zeroed();
    caller.read_bytes(arg, header.as_bytes_mut())?;

    if header.num_of_cmds == 0 || header.num_of_cmds > MAX_CMDS_PER_IOCTL {
        return Err(RpmbError::InvalidCommandCount(header.num_of_cmds));
    }

    let mut cmds = vec![MmcIocCmd::new_zeroed(); header.num_of_cmds as usize];
    caller.read_bytes(arg + size_of::<MmcIocMultiCmd>() as u64, cmds.as_bytes_mut())?;

    for cmd in &cmds {
        execute_cmd(backend, caller, cmd)?;
    }
    Ok(())
}

fn execute_cmd<M: CallerMemory>(
    backend: &mut RpmbBackend,
    caller: &M,
    cmd: &MmcIocCmd,
) -> Result<()> {
    debug!(
        "cmd opcode={} blocks={} blksz={} data_ptr={:#x}",
        cmd.opcode, cmd.blocks, cmd.blksz, cmd.data_ptr
    );

    match cmd.opcode {
        MMC_SET_BLOCK_COUNT | MMC_STOP_TRANSMISSION => Ok(()),
        MMC_WRITE_MULTIPLE_BLOCK => {
            if cmd.data_len() == 0 || cmd.data_ptr == 0 {
                return Err(RpmbError::MissingPayload(cmd.opcode));
            }
            let mut payload = vec![0_u8; cmd.data_len()];
            caller.read_bytes(cmd.data_ptr, &mut payload)?;

            if log_enabled!(Level::Debug) {
                if let Some(first) = Frame::read_from_prefix(payload.as_slice()) {
                    debug!(
                        "request frames: type={:#06x} addr={} count={} head={}",
                        first.req_resp.get(),
                        first.address.get(),
                        first.block_count.get(),
                        HEXLOWER.encode(&payload[..64.min(payload.len())])
                    );
                }
            }

            backend.write_request_frames(&payload);
            Ok(())
        }
        MMC_READ_MULTIPLE_BLOCK => {
            if cmd.data_len() == 0 || cmd.data_ptr == 0 {
                return Err(RpmbError::MissingPayload(cmd.opcode));
            }
            // The read sub-command carries the authoritative block count
            // for a latched DATA_READ.
            let mut blk_cnt = cmd.blocks as u16;
            if blk_cnt == 0 {
                blk_cnt = (cmd.blksz / RPMB_FRAME_SIZE as u32) as u16;
            }
            if backend.has_pending_read() {
                backend.finalize_pending_read(blk_cnt);
            }

            let mut resp = vec![0_u8; cmd.data_len()];
            backend.read_response_frames(&mut resp);
            caller.write_bytes(cmd.data_ptr, &resp)
        }
        other => Err(RpmbError::UnsupportedOpcode(other)),
    }
}
