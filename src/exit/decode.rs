//! Minimal decode of memory-accessing instructions (§4.1).
//!
//! Hardware tells the dispatcher *that* the guest touched memory it
//! shouldn't have (CR2 plus a page-fault error code, or an EPT-violation
//! GPA), but for a fault serviced by emulation rather than a straight
//! map-and-resume — an instruction trapping on a hooked region, for
//! instance — the dispatcher also needs to know which direction the access
//! went and how wide it was. This does not attempt a general x86 decoder;
//! it recognizes the handful of memory-accessing forms a device-hook or
//! shadow-paging emulation path actually needs to finish servicing an
//! access, and returns `None` for anything else (the caller falls back to
//! failing the VM rather than guessing).

use crate::paging::AccessKind;

/// Operand width in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Dword,
    Qword,
}

impl Width {
    pub fn bytes(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Dword => 4,
            Width::Qword => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedAccess {
    pub kind: AccessKind,
    pub width: Width,
    /// Set when a `REP`/`REPNE` prefix was present (string instructions);
    /// the caller must re-derive the per-iteration address itself since a
    /// `rep movs` can span many pages. An address-size override (`0x67`)
    /// truncates each computed address to 32 bits for the duration of the
    /// rep loop rather than just the first iteration — this decoder
    /// reports the override but leaves applying it, per iteration, to the
    /// caller (§4.1 open question: "does an address-size override on a
    /// rep-prefixed string op apply once or per iteration" — resolved as
    /// per-iteration, matching real hardware).
    pub repeated: bool,
    pub address_size_override: bool,
}

const PREFIX_OPERAND_SIZE: u8 = 0x66;
const PREFIX_ADDRESS_SIZE: u8 = 0x67;
const PREFIX_REP: u8 = 0xF3;
const PREFIX_REPNE: u8 = 0xF2;

fn is_rex(byte: u8) -> bool {
    (0x40..=0x4F).contains(&byte)
}

fn rex_w(byte: u8) -> bool {
    byte & 0x08 != 0
}

/// Decode the leading prefixes and opcode of a memory-accessing
/// instruction's raw bytes (as fetched from the guest's code segment at
/// the faulting RIP). Returns `None` if the opcode is not one of the
/// recognized memory-touching forms.
pub fn decode_mem_access(bytes: &[u8]) -> Option<DecodedAccess> {
    let mut i = 0;
    let mut operand_size_override = false;
    let mut address_size_override = false;
    let mut repeated = false;
    let mut rex: Option<u8> = None;

    while i < bytes.len() {
        match bytes[i] {
            PREFIX_OPERAND_SIZE => operand_size_override = true,
            PREFIX_ADDRESS_SIZE => address_size_override = true,
            PREFIX_REP | PREFIX_REPNE => repeated = true,
            b if is_rex(b) => {
                rex = Some(b);
                i += 1;
                break;
            }
            _ => break,
        }
        i += 1;
    }

    let opcode = *bytes.get(i)?;
    let default_width = match (rex.map(rex_w).unwrap_or(false), operand_size_override) {
        (true, _) => Width::Qword,
        (false, true) => Width::Word,
        (false, false) => Width::Dword,
    };

    let (kind, width) = match opcode {
        // MOV r/m8, r8 — store.
        0x88 => (AccessKind::Write, Width::Byte),
        // MOV r/m(16/32/64), r — store.
        0x89 => (AccessKind::Write, default_width),
        // MOV r8, r/m8 — load.
        0x8A => (AccessKind::Read, Width::Byte),
        // MOV r(16/32/64), r/m — load.
        0x8B => (AccessKind::Read, default_width),
        // MOV r/m8, imm8 — store.
        0xC6 => (AccessKind::Write, Width::Byte),
        // MOV r/m(16/32/64), imm32 — store.
        0xC7 => (AccessKind::Write, default_width),
        // MOVS m8, m8 — string move, counts as both, but the side that
        // matters for a hooked region is wherever the fault address fell;
        // callers resolve direction from the faulting address, so report
        // the (conservative) wider of the two roles as a write.
        0xA4 => (AccessKind::Write, Width::Byte),
        0xA5 => (AccessKind::Write, default_width),
        // STOS m8/m, AL/eAX — string store.
        0xAA => (AccessKind::Write, Width::Byte),
        0xAB => (AccessKind::Write, default_width),
        // LODS AL/eAX, m8/m — string load.
        0xAC => (AccessKind::Read, Width::Byte),
        0xAD => (AccessKind::Read, default_width),
        _ => return None,
    };

    Some(DecodedAccess {
        kind,
        width,
        repeated,
        address_size_override,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_store_is_recognized() {
        let access = decode_mem_access(&[0x88, 0xC0]).unwrap();
        assert_eq!(access.kind, AccessKind::Write);
        assert_eq!(access.width, Width::Byte);
    }

    #[test]
    fn rex_w_widens_a_dword_load_to_qword() {
        let access = decode_mem_access(&[0x48, 0x8B, 0x00]).unwrap();
        assert_eq!(access.kind, AccessKind::Read);
        assert_eq!(access.width, Width::Qword);
    }

    #[test]
    fn operand_size_override_narrows_to_word() {
        let access = decode_mem_access(&[0x66, 0x89, 0x00]).unwrap();
        assert_eq!(access.width, Width::Word);
    }

    #[test]
    fn rep_prefixed_stos_reports_repeated_and_address_override() {
        let access = decode_mem_access(&[0xF3, 0x67, 0xAA]).unwrap();
        assert!(access.repeated);
        assert!(access.address_size_override);
        assert_eq!(access.kind, AccessKind::Write);
    }

    #[test]
    fn unrecognized_opcode_returns_none() {
        assert!(decode_mem_access(&[0x90]).is_none());
    }
}


