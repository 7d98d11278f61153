/* Dex file format structures: the subset a de-quickening pass has to
 * understand. The archive is held as one owned byte buffer plus the parsed
 * tables needed to locate and name each method's instruction region. */

use log::debug;

use crate::dex::{read_u2, read_u4, read_uleb128, read_x, write_u1, write_u4, write_uleb128, write_x};
use crate::error::{fail_format, VdexError, VdexResult};

/* Constants */
pub const HEADER_SIZE: usize = 0x70;
pub const ENDIAN_CONSTANT: u32 = 0x12345678;
pub const NO_INDEX: u32 = 0xffffffff;

/// Dex versions this converter understands. Anything else is rejected
/// rather than guessed at.
pub const SUPPORTED_DEX_VERSIONS: [u32; 4] = [35, 37, 38, 39];

/// Byte offset of the adler-32 checksum field in the header.
pub const CHECKSUM_OFFSET: usize = 8;
/// First byte covered by the adler-32 checksum.
pub const CHECKSUM_DATA_START: usize = 12;
/// Byte offset of the SHA-1 signature field in the header.
pub const SIGNATURE_OFFSET: usize = 12;
/// First byte covered by the SHA-1 signature.
pub const SIGNATURE_DATA_START: usize = 32;

#[derive(Debug, PartialEq, Eq)]
pub struct Header {
    pub magic: [u8; 8],
    pub checksum: u32,
    pub signature: [u8; 20],
    pub file_size: u32,
    pub header_size: u32,
    pub endian_tag: u32,
    pub link_size: u32,
    pub link_off: u32,
    pub map_off: u32,
    pub string_ids_size: u32,
    pub string_ids_off: u32,
    pub type_ids_size: u32,
    pub type_ids_off: u32,
    pub proto_ids_size: u32,
    pub proto_ids_off: u32,
    pub field_ids_size: u32,
    pub field_ids_off: u32,
    pub method_ids_size: u32,
    pub method_ids_off: u32,
    pub class_defs_size: u32,
    pub class_defs_off: u32,
    pub data_size: u32,
    pub data_off: u32,
}

impl Header {
    pub fn read(bytes: &[u8], ix: &mut usize) -> VdexResult<Header> {
        if bytes.len() < HEADER_SIZE {
            fail_format!("not enough bytes for dex header: {}", bytes.len());
        }

        let magic = <[u8; 8]>::try_from(read_x(bytes, ix, 8)?).unwrap();
        if &magic[0..4] != b"dex\n" || magic[7] != 0 {
            fail_format!("invalid dex magic value {:02x?}", magic);
        }
        let version = Self::version_from_magic(&magic)
            .ok_or_else(|| VdexError::Format(format!("non-numeric dex version {:02x?}", &magic[4..7])))?;
        if !SUPPORTED_DEX_VERSIONS.contains(&version) {
            fail_format!("unsupported dex version {:03}", version);
        }

        let header = Header {
            magic,
            checksum: read_u4(bytes, ix)?,
            signature: <[u8; 20]>::try_from(read_x(bytes, ix, 20)?).unwrap(),
            file_size: read_u4(bytes, ix)?,
            header_size: read_u4(bytes, ix)?,
            endian_tag: read_u4(bytes, ix)?,
            link_size: read_u4(bytes, ix)?,
            link_off: read_u4(bytes, ix)?,
            map_off: read_u4(bytes, ix)?,
            string_ids_size: read_u4(bytes, ix)?,
            string_ids_off: read_u4(bytes, ix)?,
            type_ids_size: read_u4(bytes, ix)?,
            type_ids_off: read_u4(bytes, ix)?,
            proto_ids_size: read_u4(bytes, ix)?,
            proto_ids_off: read_u4(bytes, ix)?,
            field_ids_size: read_u4(bytes, ix)?,
            field_ids_off: read_u4(bytes, ix)?,
            method_ids_size: read_u4(bytes, ix)?,
            method_ids_off: read_u4(bytes, ix)?,
            class_defs_size: read_u4(bytes, ix)?,
            class_defs_off: read_u4(bytes, ix)?,
            data_size: read_u4(bytes, ix)?,
            data_off: read_u4(bytes, ix)?,
        };

        if header.endian_tag != ENDIAN_CONSTANT {
            fail_format!("unsupported endian tag 0x{:08x}", header.endian_tag);
        }
        if header.header_size as usize != HEADER_SIZE {
            fail_format!("unexpected header size {}", header.header_size);
        }

        Ok(header)
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        let mut c = 0;
        c += write_x(bytes, &self.magic);
        c += write_u4(bytes, self.checksum);
        c += write_x(bytes, &self.signature);
        c += write_u4(bytes, self.file_size);
        c += write_u4(bytes, self.header_size);
        c += write_u4(bytes, self.endian_tag);
        c += write_u4(bytes, self.link_size);
        c += write_u4(bytes, self.link_off);
        c += write_u4(bytes, self.map_off);
        c += write_u4(bytes, self.string_ids_size);
        c += write_u4(bytes, self.string_ids_off);
        c += write_u4(bytes, self.type_ids_size);
        c += write_u4(bytes, self.type_ids_off);
        c += write_u4(bytes, self.proto_ids_size);
        c += write_u4(bytes, self.proto_ids_off);
        c += write_u4(bytes, self.field_ids_size);
        c += write_u4(bytes, self.field_ids_off);
        c += write_u4(bytes, self.method_ids_size);
        c += write_u4(bytes, self.method_ids_off);
        c += write_u4(bytes, self.class_defs_size);
        c += write_u4(bytes, self.class_defs_off);
        c += write_u4(bytes, self.data_size);
        c += write_u4(bytes, self.data_off);
        c
    }

    fn version_from_magic(magic: &[u8; 8]) -> Option<u32> {
        let d0 = magic[4];
        let d1 = magic[5];
        let d2 = magic[6];
        if d0.is_ascii_digit() && d1.is_ascii_digit() && d2.is_ascii_digit() {
            Some(((d0 - b'0') as u32) * 100 + ((d1 - b'0') as u32) * 10 + ((d2 - b'0') as u32))
        } else {
            None
        }
    }
}

#[derive(Debug, Eq, PartialEq, Clone)]
pub enum DexString {
    Decoded(String),
    Raw(u32, Vec<u8>),
}

impl DexString {
    pub fn read(bytes: &[u8], ix: &mut usize) -> VdexResult<DexString> {
        let utf16_size = read_uleb128(bytes, ix)?;
        let mut v = vec![];

        loop {
            let u = crate::dex::read_u1(bytes, ix)?;
            if u != 0 {
                v.push(u);
            } else {
                break;
            }
        }

        Ok(match cesu8::from_java_cesu8(v.as_slice()) {
            Ok(converted_str) => DexString::Decoded(converted_str.to_string()),
            _ => DexString::Raw(utf16_size, v),
        })
    }

    pub fn write(&self, bytes: &mut Vec<u8>) -> usize {
        let mut c = 0;
        match self {
            DexString::Raw(utf16_size, v) => {
                c += write_uleb128(bytes, *utf16_size);
                c += write_x(bytes, v);
                c += write_u1(bytes, 0);
            }
            DexString::Decoded(s) => {
                let encoded = cesu8::to_java_cesu8(s).to_vec();
                c += write_uleb128(bytes, s.chars().count() as u32);
                c += write_x(bytes, encoded.as_slice());
                c += write_u1(bytes, 0);
            }
        }
        c
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct MethodItem {
    // The method_id_item struct
    pub class_idx: u16,
    pub proto_idx: u16,
    pub name_idx: u32,
}

impl MethodItem {
    pub fn read(bytes: &[u8], ix: &mut usize) -> VdexResult<MethodItem> {
        Ok(MethodItem {
            class_idx: read_u2(bytes, ix)?,
            proto_idx: read_u2(bytes, ix)?,
            name_idx: read_u4(bytes, ix)?,
        })
    }
}

/// Location of one method's instruction region inside the archive bytes.
/// The region length is immutable: de-quickening rewrites bytes in place and
/// never changes the instruction-stream length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodCode {
    pub method_idx: u32,
    /// Absolute byte offset of the insns array within the archive.
    pub insns_off: usize,
    /// Length of the insns array in bytes (2 * insns_size code units).
    pub insns_len: usize,
}

/// An independently owned, mutable copy of one dex archive extracted from a
/// vdex container. Mutation never touches the container's backing bytes.
#[derive(Debug)]
pub struct MutableArchive {
    bytes: Vec<u8>,
    header: Header,
    strings: Vec<DexString>,
    types: Vec<u32>,
    methods: Vec<MethodItem>,
    codes: Vec<MethodCode>,
}

impl MutableArchive {
    /// Parses `bytes` as a dex file and takes an owned copy, with every
    /// method's instruction region located and bounds-checked against the
    /// declared archive size.
    pub fn from_bytes(bytes: &[u8]) -> VdexResult<MutableArchive> {
        let mut ix = 0;
        let header = Header::read(bytes, &mut ix)?;

        if header.file_size as usize != bytes.len() {
            fail_format!(
                "dex header declares {} bytes but the archive record holds {}",
                header.file_size,
                bytes.len()
            );
        }

        for (what, count, entry) in [
            ("string", header.string_ids_size, 4usize),
            ("type", header.type_ids_size, 4),
            ("method", header.method_ids_size, 8),
            ("class def", header.class_defs_size, 0x20),
        ] {
            if (count as usize).saturating_mul(entry) > bytes.len() {
                fail_format!("{} id table of {} entries cannot fit the archive", what, count);
            }
        }

        // String ids -> string data
        let mut strings = Vec::with_capacity(header.string_ids_size as usize);
        ix = header.string_ids_off as usize;
        for _ in 0..header.string_ids_size {
            let mut string_off = read_u4(bytes, &mut ix)? as usize;
            strings.push(DexString::read(bytes, &mut string_off)?);
        }

        // Type ids (indexes into the string table)
        let mut types = Vec::with_capacity(header.type_ids_size as usize);
        ix = header.type_ids_off as usize;
        for _ in 0..header.type_ids_size {
            let string_idx = read_u4(bytes, &mut ix)?;
            if string_idx as usize >= strings.len() {
                fail_format!("type id references string {} of {}", string_idx, strings.len());
            }
            types.push(string_idx);
        }

        // Method ids
        let mut methods = Vec::with_capacity(header.method_ids_size as usize);
        ix = header.method_ids_off as usize;
        for _ in 0..header.method_ids_size {
            methods.push(MethodItem::read(bytes, &mut ix)?);
        }

        // Class defs -> class data -> per-method code regions
        let mut codes = vec![];
        ix = header.class_defs_off as usize;
        for _ in 0..header.class_defs_size {
            let class_def = read_x(bytes, &mut ix, 0x20)?;
            let mut field_ix = 24; // class_data_off is the 7th u32
            let class_data_off = read_u4(&class_def, &mut field_ix)? as usize;
            if class_data_off == 0 {
                continue;
            }
            read_class_data(bytes, class_data_off, methods.len(), &mut codes)?;
        }

        debug!(
            "extracted dex: {} strings, {} methods, {} code regions",
            strings.len(),
            methods.len(),
            codes.len()
        );

        Ok(MutableArchive {
            bytes: bytes.to_vec(),
            header,
            strings,
            types,
            methods,
            codes,
        })
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.bytes
    }

    pub(crate) fn set_checksums(&mut self, checksum: u32, signature: [u8; 20]) {
        self.header.checksum = checksum;
        self.header.signature = signature;
    }

    pub fn method_count(&self) -> u32 {
        self.methods.len() as u32
    }

    /// Instruction regions in class-data order.
    pub fn codes(&self) -> &[MethodCode] {
        &self.codes
    }

    pub fn insns(&self, code: &MethodCode) -> &[u8] {
        &self.bytes[code.insns_off..code.insns_off + code.insns_len]
    }

    pub fn insns_mut(&mut self, code: &MethodCode) -> &mut [u8] {
        &mut self.bytes[code.insns_off..code.insns_off + code.insns_len]
    }

    /// Best-effort `Lclass;->name` rendering of a method id for diagnostics.
    pub fn method_name(&self, method_idx: u32) -> String {
        let Some(method) = self.methods.get(method_idx as usize) else {
            return format!("method@{method_idx}");
        };
        let class = self
            .types
            .get(method.class_idx as usize)
            .and_then(|string_idx| self.strings.get(*string_idx as usize))
            .and_then(|s| match s {
                DexString::Decoded(s) => Some(s.clone()),
                DexString::Raw(_, _) => None,
            })
            .unwrap_or_else(|| format!("Ltype@{};", method.class_idx));
        let name = self
            .strings
            .get(method.name_idx as usize)
            .and_then(|s| match s {
                DexString::Decoded(s) => Some(s.clone()),
                DexString::Raw(_, _) => None,
            })
            .unwrap_or_else(|| format!("string@{}", method.name_idx));
        format!("{class}->{name}")
    }
}

/// Walks a class_data_item, recording the insns region of every method that
/// carries code. Fails if a region extends past the archive boundary.
fn read_class_data(
    bytes: &[u8],
    class_data_off: usize,
    method_id_count: usize,
    codes: &mut Vec<MethodCode>,
) -> VdexResult<()> {
    let mut ix = class_data_off;
    let static_field_size = read_uleb128(bytes, &mut ix)?;
    let instance_field_size = read_uleb128(bytes, &mut ix)?;
    let direct_method_size = read_uleb128(bytes, &mut ix)?;
    let virtual_method_size = read_uleb128(bytes, &mut ix)?;

    for _ in 0..static_field_size + instance_field_size {
        read_uleb128(bytes, &mut ix)?; // field_idx_diff
        read_uleb128(bytes, &mut ix)?; // access_flags
    }

    let walk_methods = |count: u32, ix: &mut usize, codes: &mut Vec<MethodCode>| -> VdexResult<()> {
        let mut method_idx: u32 = 0;
        for _ in 0..count {
            let idx_diff = read_uleb128(bytes, ix)?;
            method_idx = method_idx.wrapping_add(idx_diff);
            read_uleb128(bytes, ix)?; // access_flags
            let code_off = read_uleb128(bytes, ix)? as usize;
            if code_off == 0 {
                continue;
            }
            if method_idx as usize >= method_id_count {
                fail_format!(
                    "class data references method {} of {}",
                    method_idx,
                    method_id_count
                );
            }
            let mut code_ix = code_off;
            // code_item: registers, ins, outs, tries, debug_info_off, insns_size
            read_u2(bytes, &mut code_ix)?;
            read_u2(bytes, &mut code_ix)?;
            read_u2(bytes, &mut code_ix)?;
            read_u2(bytes, &mut code_ix)?;
            read_u4(bytes, &mut code_ix)?;
            let insns_units = read_u4(bytes, &mut code_ix)? as usize;
            let insns_off = code_ix;
            let insns_len = insns_units
                .checked_mul(2)
                .ok_or_else(|| VdexError::Format("insns_size overflows".to_string()))?;
            if insns_off + insns_len > bytes.len() {
                fail_format!(
                    "method {} bytecode region [{}, {}) extends past the archive boundary ({})",
                    method_idx,
                    insns_off,
                    insns_off + insns_len,
                    bytes.len()
                );
            }
            codes.push(MethodCode {
                method_idx,
                insns_off,
                insns_len,
            });
        }
        Ok(())
    };

    walk_methods(direct_method_size, &mut ix, codes)?;
    walk_methods(virtual_method_size, &mut ix, codes)?;
    Ok(())
}
