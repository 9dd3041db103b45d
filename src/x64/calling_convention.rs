//! Entry conventions and stack frame layout of generated functions.
//!
//! Every generated function takes one argument, the CPU state pointer. Translated functions
//! receive it according to the session's `CallConv`; helpers and calls between generated
//! functions always use System V (pointer in rdi).

use super::encoder::EncodingError;
use iced_x86::code_asm::{r12, rdi, AsmRegister64};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallConv {
    /// CPU state pointer in rdi.
    SysV,
    /// CPU state pointer in r12, as HHVM-style callers pass it.
    Hhvm,
}

impl CallConv {
    pub fn sptr_register(self) -> AsmRegister64 {
        match self {
            CallConv::SysV => rdi,
            CallConv::Hhvm => r12,
        }
    }
}

/// Frame of a generated function.
///
/// ```text
/// rbp + 8    return address
/// rbp + 0    saved rbp
/// rbp - 8    saved rbx (state pointer home)
/// rbp - 16   slot of value 0, then one 8-byte slot per value downwards
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionFrame {
    frame_size: u32,
}

impl FunctionFrame {
    const FIRST_SLOT: i64 = -16;

    pub fn new(slots: usize) -> Result<Self, EncodingError> {
        // Entry rsp is 8 mod 16; pushing rbp and rbx leaves it at 8 mod 16 again.
        let size = (slots as u64 * 8).div_ceil(16) * 16 + 8;
        match i32::try_from(size) {
            Ok(size) => Ok(Self {
                frame_size: size as u32,
            }),
            Err(_) => Err(EncodingError::FrameTooLarge { slots }),
        }
    }

    /// Bytes to subtract from rsp after the two pushes so rsp stays 16-byte aligned at calls.
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// rbp-relative displacement of the slot holding value `index`.
    pub fn slot_disp(&self, index: u32) -> i32 {
        (Self::FIRST_SLOT - 8 * index as i64) as i32
    }
}
