//! Layout of the guest CPU state structure passed to every translated function.
//!
//! The client owns the structure; both sides must agree on these offsets.

/// Guest instruction pointer.
pub const RIP: u16 = 0;

/// Offset of general purpose register `n` (RAX = 0 ... R15 = 15).
pub const fn gpr(n: u8) -> u16 {
    8 + 8 * n as u16
}

pub const RAX: u16 = gpr(0);
pub const RCX: u16 = gpr(1);
pub const RDX: u16 = gpr(2);
pub const RSP: u16 = gpr(4);

/// Status flags, one byte each holding 0 or 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Zf,
    Sf,
    Cf,
    Of,
}

impl Flag {
    pub const ALL: [Flag; 4] = [Flag::Zf, Flag::Sf, Flag::Cf, Flag::Of];

    pub const fn offset(self) -> u16 {
        FLAGS
            + match self {
                Flag::Zf => 0,
                Flag::Sf => 1,
                Flag::Cf => 2,
                Flag::Of => 3,
            }
    }

    /// Whether a state offset addresses one of the flag bytes.
    pub fn is_flag_offset(offset: u16) -> bool {
        (FLAGS..FLAGS + 4).contains(&offset)
    }
}

pub const FLAGS: u16 = gpr(16);
pub const FS_BASE: u16 = 144;
pub const GS_BASE: u16 = 152;

/// Total size of the structure.
pub const SIZE: usize = 160;
