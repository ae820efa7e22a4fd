// CUSE RPMB character-device backend
//
// Copyright 2023 Linaro Ltd. All Rights Reserved.
//
// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

use data_encoding::HEXUPPER;
use zerocopy::{
    byteorder::{BigEndian, U16, U32},
    AsBytes, FromBytes, FromZeroes,
};

pub type Be16 = U16<BigEndian>;
pub type Be32 = U32<BigEndian>;

// Frame geometry from the JEDEC eMMC standard; the offsets are contractual
// and match the Linux kernel's RPMB frame layout.
pub const RPMB_FRAME_SIZE: usize = 512;
pub const RPMB_STUFF_SIZE: usize = 196;
pub const RPMB_KEY_MAC_SIZE: usize = 32;
pub const RPMB_BLOCK_SIZE: usize = 256;
pub const RPMB_NONCE_SIZE: usize = 16;

/// Offset of the first MAC-covered byte. The HMAC input is the contiguous
/// run from the data field through the end of the frame (284 bytes).
pub const MAC_REGION_OFFSET: usize = RPMB_STUFF_SIZE + RPMB_KEY_MAC_SIZE;
pub const MAC_REGION_SIZE: usize = RPMB_FRAME_SIZE - MAC_REGION_OFFSET;

pub type KeySlice = [u8; RPMB_KEY_MAC_SIZE];
pub type Nonce = [u8; RPMB_NONCE_SIZE];

/// The authentication key. Programmed exactly once in normal operation;
/// replacing it needs an explicit opt-in.
pub struct Key(Option<KeySlice>);

impl Key {
    pub const fn new() -> Self {
        Self(None)
    }

    pub const fn new_with(val: KeySlice) -> Self {
        Self(Some(val))
    }

    pub fn program(&mut self, val: KeySlice, allow_rekey: bool) -> Result<(), crate::RpmbError> {
        if self.0.is_some() && !allow_rekey {
            return Err(crate::RpmbError::KeyAlreadySet);
        }
        self.0 = Some(val);
        Ok(())
    }

    pub fn get(&self) -> Result<KeySlice, crate::RpmbError> {
        self.0.ok_or(crate::RpmbError::KeyNotSet)
    }

    pub const fn is_programmed(&self) -> bool {
        self.0.is_some()
    }
}

impl Default for Key {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut ret = fmt.debug_tuple(stringify!(Key));
        if let Some(bytes) = self.0.as_ref() {
            ret.field(&format_args!("{}", HEXUPPER.encode(bytes.as_slice())))
        } else {
            ret.field(&"uninitialized")
        }
        .finish()
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        if let Some(bytes) = self.0.as_ref() {
            write!(fmt, "{}", HEXUPPER.encode(bytes.as_slice()))
        } else {
            write!(fmt, "uninitialized")
        }
    }
}

macro_rules! impl_frame_type_int {
    ($t:ty, $($var:tt),+) => {
        impl std::convert::TryFrom<u16> for $t {
            type Error = crate::RpmbError;

            fn try_from(val: u16) -> Result<Self, Self::Error> {
                Ok(match val {
                    $(v if v == Self::$var as u16 => Self::$var),*,
                      other => return Err(crate::RpmbError::UnknownFrameType(other)),
                })
            }
        }

        impl From<$t> for u16 {
            fn from(r: $t) -> Self {
                r as Self
            }
        }

        impl From<$t> for Be16 {
            fn from(r: $t) -> Self {
                (r as u16).into()
            }
        }
    };
}

/// RPMB request types.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RpmbRequestKind {
    #[doc(alias = "RPMB_PROGRAM_KEY")]
    ProgramKey = 0x0001,
    #[doc(alias = "RPMB_GET_WRITE_COUNTER")]
    GetWriteCounter = 0x0002,
    #[doc(alias = "RPMB_WRITE_DATA")]
    DataWrite = 0x0003,
    #[doc(alias = "RPMB_READ_DATA")]
    DataRead = 0x0004,
    #[doc(alias = "RPMB_RESULT_READ")]
    ResultRead = 0x0005,
}

impl_frame_type_int!(
    RpmbRequestKind,
    ProgramKey,
    GetWriteCounter,
    DataWrite,
    DataRead,
    ResultRead
);

/// RPMB response types: the request code shifted into the high byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RpmbResponseKind {
    ProgramKey = 0x0100,
    GetCounter = 0x0200,
    DataWrite = 0x0300,
    DataRead = 0x0400,
    ResultRead = 0x0500,
}

impl_frame_type_int!(
    RpmbResponseKind,
    ProgramKey,
    GetCounter,
    DataWrite,
    DataRead,
    ResultRead
);

/// RPMB operation results carried in the result field of a response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RpmbOpResult {
    Ok = 0x0000,
    GeneralFailure = 0x0001,
    AuthFailure = 0x0002,
    CountFailure = 0x0003,
    AddrFailure = 0x0004,
    WriteFailure = 0x0005,
    ReadFailure = 0x0006,
    NoAuthKey = 0x0007,
    /// JEDEC defines bit 7 as "write counter expired". The emulated counter
    /// wraps instead, so this is never produced.
    WriteCounterExpired = 0x0080,
}

impl_frame_type_int!(
    RpmbOpResult,
    Ok,
    GeneralFailure,
    AuthFailure,
    CountFailure,
    AddrFailure,
    WriteFailure,
    ReadFailure,
    NoAuthKey,
    WriteCounterExpired
);

/// One 512-byte RPMB frame. Everything after the stuff bytes takes part in
/// authentication; the trailing integers are big-endian on the wire.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes, FromZeroes)]
pub struct Frame {
    pub stuff: [u8; RPMB_STUFF_SIZE],
    pub key_mac: [u8; RPMB_KEY_MAC_SIZE],
    pub data: [u8; RPMB_BLOCK_SIZE],
    pub nonce: Nonce,
    pub write_counter: Be32,
    pub address: Be16,
    pub block_count: Be16,
    pub result: Be16,
    pub req_resp: Be16,
}

impl Frame {
    /// A zeroed response skeleton; callers fill in addr/count/nonce/data as
    /// the operation requires.
    pub fn response(kind: RpmbResponseKind, result: RpmbOpResult, write_counter: u32) -> Self {
        let mut frame = Self::new_zeroed();
        frame.req_resp = kind.into();
        frame.result = result.into();
        frame.write_counter = write_counter.into();
        frame
    }

    /// The 284 MAC-covered bytes: data, nonce, write counter, address,
    /// block count, result and req/resp type.
    pub fn mac_region(&self) -> &[u8] {
        &self.as_bytes()[MAC_REGION_OFFSET..]
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_is_one_sector() {
        assert_eq!(std::mem::size_of::<Frame>(), RPMB_FRAME_SIZE);
        assert_eq!(std::mem::align_of::<Frame>(), 1);
    }

    #[test]
    fn field_offsets_are_contractual() {
        let mut frame = Frame::new_zeroed();
        frame.key_mac[0] = 0xA1;
        frame.data[0] = 0xA2;
        frame.nonce[0] = 0xA3;
        frame.write_counter = 0x0102_0304.into();
        frame.address = 0x0506.into();
        frame.block_count = 0x0708.into();
        frame.result = 0x090A.into();
        frame.req_resp = 0x0B0C.into();

        let bytes = frame.as_bytes();
        assert_eq!(bytes[0x0C4], 0xA1);
        assert_eq!(bytes[0x0E4], 0xA2);
        assert_eq!(bytes[0x1E4], 0xA3);
        assert_eq!(&bytes[0x1F4..0x1F8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[0x1F8..0x1FA], &[0x05, 0x06]);
        assert_eq!(&bytes[0x1FA..0x1FC], &[0x07, 0x08]);
        assert_eq!(&bytes[0x1FC..0x1FE], &[0x09, 0x0A]);
        assert_eq!(&bytes[0x1FE..0x200], &[0x0B, 0x0C]);
    }

    #[test]
    fn mac_region_runs_from_data_to_frame_end() {
        let mut frame = Frame::new_zeroed();
        frame.data[0] = 0x11;
        frame.req_resp = 0x2233.into();

        let region = frame.mac_region();
        assert_eq!(region.len(), MAC_REGION_SIZE);
        assert_eq!(region.len(), 284);
        assert_eq!(region[0], 0x11);
        assert_eq!(region[region.len() - 2..], [0x22, 0x33]);
    }

    #[test]
    fn request_kind_parses_known_codes() {
        assert_eq!(
            RpmbRequestKind::try_from(0x0003_u16).unwrap(),
            RpmbRequestKind::DataWrite
        );
        assert!(matches!(
            RpmbRequestKind::try_from(0x0009_u16),
            Err(crate::RpmbError::UnknownFrameType(0x0009))
        ));
    }

    #[test]
    fn response_kind_encodes_big_endian() {
        let be: Be16 = RpmbResponseKind::DataRead.into();
        assert_eq!(be.get(), 0x0400);
    }

    #[test]
    fn key_programs_once() {
        let mut key = Key::new();
        assert!(!key.is_programmed());
        assert!(matches!(key.get(), Err(crate::RpmbError::KeyNotSet)));

        key.program([7; 32], false).unwrap();
        assert_eq!(key.get().unwrap(), [7; 32]);
        assert!(matches!(
            key.program([8; 32], false),
            Err(crate::RpmbError::KeyAlreadySet)
        ));
        assert_eq!(key.get().unwrap(), [7; 32]);

        key.program([8; 32], true).unwrap();
        assert_eq!(key.get().unwrap(), [8; 32]);
    }

    #[test]
    fn key_renders_as_hex() {
        let key = Key::new_with([0xAB; 32]);
        assert_eq!(key.to_string(), "AB".repeat(32));
        assert_eq!(Key::new().to_string(), "uninitialized");
    }
}
