use bitflags::bitflags;
use once_cell::sync::Lazy;

use crate::error::{fail_format, VdexResult};

/// Instruction encodings of the Dalvik bytecode, named after the format ids
/// in the dex specification (e.g. `Format22c` = two registers, one constant
/// pool index, two code units).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Format10t,
    Format10x,
    Format11n,
    Format11x,
    Format12x,
    Format20t,
    Format21c,
    Format21ih,
    Format21lh,
    Format21s,
    Format21t,
    Format22b,
    Format22c,
    Format22cs,
    Format22s,
    Format22t,
    Format22x,
    Format23x,
    Format30t,
    Format31c,
    Format31i,
    Format31t,
    Format32x,
    Format35c,
    Format35ms,
    Format3rc,
    Format3rms,
    Format45cc,
    Format4rcc,
    Format51l,
}

impl Format {
    /// Width of the encoding in 16-bit code units.
    pub const fn units(&self) -> usize {
        match self {
            Format::Format10t
            | Format::Format10x
            | Format::Format11n
            | Format::Format11x
            | Format::Format12x => 1,

            Format::Format20t
            | Format::Format21c
            | Format::Format21ih
            | Format::Format21lh
            | Format::Format21s
            | Format::Format21t
            | Format::Format22b
            | Format::Format22c
            | Format::Format22cs
            | Format::Format22s
            | Format::Format22t
            | Format::Format22x
            | Format::Format23x => 2,

            Format::Format30t
            | Format::Format31c
            | Format::Format31i
            | Format::Format31t
            | Format::Format32x
            | Format::Format35c
            | Format::Format35ms
            | Format::Format3rc
            | Format::Format3rms => 3,

            Format::Format45cc | Format::Format4rcc => 4,

            Format::Format51l => 5,
        }
    }
}

bitflags! {
    /// Properties of an opcode relevant to the de-quickening walk.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InsnFlags: u8 {
        /// Only valid inside a quickened (odex/vdex) archive; never appears
        /// in a standard, verifiable dex file.
        const ODEX_ONLY = 0x1;
        /// Quickened instance field accessor (iget-quick family).
        const QUICK_FIELD_ACCESSOR = 0x2;
        /// Quickened virtual invoke (invoke-virtual-quick family).
        const QUICK_INVOKE = 0x4;
        /// A nop whose high byte may introduce a variable-width payload.
        const VARIABLE_WIDTH = 0x8;
    }
}

/// Static decoding properties of one opcode value.
#[derive(Debug, Clone, Copy)]
pub struct InsnDesc {
    pub format: Format,
    pub flags: InsnFlags,
}

/// Per-opcode decode table for the instruction set understood by the
/// converter: standard dex 035–039 opcodes plus the ART runtime's quickened
/// forms at their runtime numbering (0x73, 0xe3..=0xf2).
static INSNS: Lazy<[Option<InsnDesc>; 256]> = Lazy::new(|| {
    let mut table: [Option<InsnDesc>; 256] = [None; 256];
    for op in 0u16..=255 {
        table[op as usize] = classify(op as u8);
    }
    table
});

fn desc(format: Format) -> Option<InsnDesc> {
    Some(InsnDesc {
        format,
        flags: InsnFlags::empty(),
    })
}

fn quick(format: Format, flags: InsnFlags) -> Option<InsnDesc> {
    Some(InsnDesc {
        format,
        flags: flags | InsnFlags::ODEX_ONLY,
    })
}

fn classify(op: u8) -> Option<InsnDesc> {
    use Format::*;
    match op {
        // nop; also the carrier of packed-switch/sparse-switch/array-data payloads
        0x00 => Some(InsnDesc {
            format: Format10x,
            flags: InsnFlags::VARIABLE_WIDTH,
        }),
        // move family
        0x01 | 0x04 | 0x07 => desc(Format12x),
        0x02 | 0x05 | 0x08 => desc(Format22x),
        0x03 | 0x06 | 0x09 => desc(Format32x),
        // move-result*, move-exception
        0x0a..=0x0d => desc(Format11x),
        // return-void / return / return-wide / return-object
        0x0e => desc(Format10x),
        0x0f..=0x11 => desc(Format11x),
        // const family
        0x12 => desc(Format11n),
        0x13 => desc(Format21s),
        0x14 => desc(Format31i),
        0x15 => desc(Format21ih),
        0x16 => desc(Format21s),
        0x17 => desc(Format31i),
        0x18 => desc(Format51l),
        0x19 => desc(Format21lh),
        // const-string, const-string/jumbo, const-class
        0x1a => desc(Format21c),
        0x1b => desc(Format31c),
        0x1c => desc(Format21c),
        // monitor-enter/exit
        0x1d | 0x1e => desc(Format11x),
        // check-cast, instance-of, array-length
        0x1f => desc(Format21c),
        0x20 => desc(Format22c),
        0x21 => desc(Format12x),
        // new-instance, new-array, filled-new-array[/range], fill-array-data
        0x22 => desc(Format21c),
        0x23 => desc(Format22c),
        0x24 => desc(Format35c),
        0x25 => desc(Format3rc),
        0x26 => desc(Format31t),
        // throw, goto family
        0x27 => desc(Format11x),
        0x28 => desc(Format10t),
        0x29 => desc(Format20t),
        0x2a => desc(Format30t),
        // packed-switch, sparse-switch
        0x2b | 0x2c => desc(Format31t),
        // cmpkind
        0x2d..=0x31 => desc(Format23x),
        // if-test, if-testz
        0x32..=0x37 => desc(Format22t),
        0x38..=0x3d => desc(Format21t),
        // 0x3e..=0x43 unused
        // arrayop
        0x44..=0x51 => desc(Format23x),
        // iinstanceop
        0x52..=0x5f => desc(Format22c),
        // sstaticop
        0x60..=0x6d => desc(Format21c),
        // invoke-kind
        0x6e..=0x72 => desc(Format35c),
        // return-void-no-barrier: the quickened return-void
        0x73 => quick(Format10x, InsnFlags::empty()),
        // invoke-kind/range
        0x74..=0x78 => desc(Format3rc),
        // 0x79, 0x7a unused
        // unop
        0x7b..=0x8f => desc(Format12x),
        // binop
        0x90..=0xaf => desc(Format23x),
        // binop/2addr
        0xb0..=0xcf => desc(Format12x),
        // binop/lit16, binop/lit8
        0xd0..=0xd7 => desc(Format22s),
        0xd8..=0xe2 => desc(Format22b),
        // quickened field accessors and invokes (ART runtime numbering)
        0xe3..=0xe8 => quick(Format22cs, InsnFlags::QUICK_FIELD_ACCESSOR),
        0xe9 => quick(Format35ms, InsnFlags::QUICK_INVOKE),
        0xea => quick(Format3rms, InsnFlags::QUICK_INVOKE),
        0xeb..=0xf2 => quick(Format22cs, InsnFlags::QUICK_FIELD_ACCESSOR),
        // 0xf3..=0xf9 unused
        // invoke-polymorphic[/range], invoke-custom[/range] (dex 038+)
        0xfa => desc(Format45cc),
        0xfb => desc(Format4rcc),
        0xfc => desc(Format35c),
        0xfd => desc(Format3rc),
        // const-method-handle, const-method-type (dex 039)
        0xfe | 0xff => desc(Format21c),
        _ => None,
    }
}

/// Looks up the decode properties of an opcode value.
pub fn insn_desc(op: u8) -> Option<InsnDesc> {
    INSNS[op as usize]
}

/// True for instructions that only exist in quickened archives and must be
/// rewritten back to their canonical counterparts.
pub fn is_quickened(op: u8) -> bool {
    insn_desc(op).is_some_and(|d| d.flags.contains(InsnFlags::ODEX_ONLY))
}

// Payload idents stored in the high byte of a nop code unit.
const PACKED_SWITCH_IDENT: u8 = 0x01;
const SPARSE_SWITCH_IDENT: u8 = 0x02;
const ARRAY_DATA_IDENT: u8 = 0x03;

fn read_unit(code: &[u8], off: usize) -> VdexResult<u16> {
    let mut ix = off;
    super::read_u2(code, &mut ix)
}

/// Width in bytes of the instruction starting at `off` in a method's insns
/// region, including the variable-width payload pseudo-instructions. Fails
/// on opcodes with no defined encoding: a verified archive never contains
/// them outside a quickening context.
pub fn insn_width_bytes(code: &[u8], off: usize) -> VdexResult<usize> {
    let unit = read_unit(code, off)?;
    let op = (unit & 0x00ff) as u8;
    let hi = (unit >> 8) as u8;

    if op == 0x00 {
        match hi {
            PACKED_SWITCH_IDENT => {
                // ident, size, first_key (2 units), then size targets of 2 units each
                let size = read_unit(code, off + 2)? as usize;
                return Ok(2 * (size * 2 + 4));
            }
            SPARSE_SWITCH_IDENT => {
                // ident, size, then size keys and size targets of 2 units each
                let size = read_unit(code, off + 2)? as usize;
                return Ok(2 * (size * 4 + 2));
            }
            ARRAY_DATA_IDENT => {
                // ident, element_width, size (2 units), then ceil(size*width/2) units
                let width = read_unit(code, off + 2)? as usize;
                let size_lo = read_unit(code, off + 4)? as usize;
                let size_hi = read_unit(code, off + 6)? as usize;
                let size = (size_hi << 16) | size_lo;
                let data_units = (size * width).div_ceil(2);
                return Ok(2 * (data_units + 4));
            }
            _ => return Ok(2),
        }
    }

    match insn_desc(op) {
        Some(d) => Ok(d.format.units() * 2),
        None => fail_format!("undecodable opcode 0x{:02x} at code offset {}", op, off),
    }
}
