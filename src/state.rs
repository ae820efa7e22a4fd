// CUSE RPMB character-device backend
//
// Copyright 2023 Linaro Ltd. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Binary state file: authentication key, write counter and block storage.
//!
//! The file is machine-local, so integers are kept in host byte order. A
//! fixed header is followed by the raw storage bytes; the stored geometry
//! lets a reload detect a configuration change.

use std::{
    fs, io,
    mem::size_of,
    path::{Path, PathBuf},
};

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::io::KeySlice;

const STATE_MAGIC: [u8; 7] = *b"RPMBDv1";

#[repr(C, packed)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
struct StateHeader {
    /// 7 magic bytes; the eighth is padding and ignored on load.
    magic: [u8; 8],
    key_programmed: u8,
    key: KeySlice,
    write_counter: u32,
    max_blocks: u32,
}

/// Everything the engine persists between sessions.
pub(crate) struct Snapshot {
    pub key_programmed: bool,
    pub key: KeySlice,
    pub write_counter: u32,
    pub max_blocks: u32,
    pub storage: Vec<u8>,
}

/// Read a snapshot back from `path`. `Ok(None)` means there is no usable
/// state there (missing file, truncated header, wrong magic) and the caller
/// should start fresh; only unexpected I/O failures surface as errors.
pub(crate) fn load(path: &Path) -> io::Result<Option<Snapshot>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    let Some(header) = StateHeader::read_from_prefix(&bytes) else {
        return Ok(None);
    };
    if header.magic[..STATE_MAGIC.len()] != STATE_MAGIC {
        return Ok(None);
    }

    Ok(Some(Snapshot {
        key_programmed: header.key_programmed != 0,
        key: header.key,
        write_counter: header.write_counter,
        max_blocks: header.max_blocks,
        storage: bytes[size_of::<StateHeader>()..].to_vec(),
    }))
}

/// Serialize `snap` to a sibling temp file, then rename it over `path` so a
/// crash mid-save cannot leave a torn state file behind.
pub(crate) fn save(path: &Path, snap: &Snapshot) -> io::Result<()> {
    let mut header = StateHeader::new_zeroed();
    header.magic[..STATE_MAGIC.len()].copy_from_slice(&STATE_MAGIC);
    header.key_programmed = u8::from(snap.key_programmed);
    header.key = snap.key;
    header.write_counter = snap.write_counter;
    header.max_blocks = snap.max_blocks;

    let mut bytes = Vec::with_capacity(size_of::<StateHeader>() + snap.storage.len());
    bytes.extend_from_slice(header.as_bytes());
    bytes.extend_from_slice(&snap.storage);

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    fs::write(&tmp, &bytes)?;
    fs::rename(&tmp, path)
}
