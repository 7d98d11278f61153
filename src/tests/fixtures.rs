//! Synthetic dex and vdex fixtures for the conversion tests. The builders
//! assemble real on-disk layouts, so every test exercises the same parsing
//! paths a production container would.

use adler::adler32_slice;
use sha1::{Digest, Sha1};

use crate::dex::dex_file::{DexString, Header, ENDIAN_CONSTANT, HEADER_SIZE, NO_INDEX};
use crate::dex::{write_u2, write_u4, write_uleb128, write_x};

pub(crate) struct DexFixture {
    pub bytes: Vec<u8>,
    /// Absolute byte offset of each method's insns region, in method order.
    pub insns_offs: Vec<usize>,
}

/// Builds a sealed single-class dex file with one direct method per entry of
/// `method_insns` (given in 16-bit code units).
pub(crate) fn build_dex(method_insns: &[Vec<u16>]) -> DexFixture {
    let n = method_insns.len();
    let string_count = n + 1;
    let string_ids_off = HEADER_SIZE;
    let type_ids_off = string_ids_off + 4 * string_count;
    let method_ids_off = type_ids_off + 4;
    let class_defs_off = method_ids_off + 8 * n;
    let data_off = class_defs_off + 0x20;

    // Data section: code items first (4-aligned), then string data, then
    // class data; keeping the variable-length pieces last makes every
    // absolute offset known the moment it is written.
    let mut data = vec![];
    let mut insns_offs = vec![];
    let mut code_offs = vec![];
    for insns in method_insns {
        while (data_off + data.len()) % 4 != 0 {
            data.push(0);
        }
        code_offs.push(data_off + data.len());
        write_u2(&mut data, 1); // registers_size
        write_u2(&mut data, 0); // ins_size
        write_u2(&mut data, 0); // outs_size
        write_u2(&mut data, 0); // tries_size
        write_u4(&mut data, 0); // debug_info_off
        write_u4(&mut data, insns.len() as u32);
        insns_offs.push(data_off + data.len());
        for unit in insns {
            write_u2(&mut data, *unit);
        }
    }

    let mut string_offs = vec![];
    let mut strings = vec!["LFixture;".to_string()];
    for i in 0..n {
        strings.push(format!("m{i}"));
    }
    for s in &strings {
        string_offs.push(data_off + data.len());
        DexString::Decoded(s.clone()).write(&mut data);
    }

    let class_data_off = data_off + data.len();
    write_uleb128(&mut data, 0); // static fields
    write_uleb128(&mut data, 0); // instance fields
    write_uleb128(&mut data, n as u32); // direct methods
    write_uleb128(&mut data, 0); // virtual methods
    for (i, code_off) in code_offs.iter().enumerate() {
        write_uleb128(&mut data, u32::from(i != 0)); // method_idx_diff
        write_uleb128(&mut data, 1); // access_flags
        write_uleb128(&mut data, *code_off as u32);
    }

    let file_size = data_off + data.len();
    let header = Header {
        magic: *b"dex\n035\0",
        checksum: 0,
        signature: [0; 20],
        file_size: file_size as u32,
        header_size: HEADER_SIZE as u32,
        endian_tag: ENDIAN_CONSTANT,
        link_size: 0,
        link_off: 0,
        map_off: 0,
        string_ids_size: string_count as u32,
        string_ids_off: string_ids_off as u32,
        type_ids_size: 1,
        type_ids_off: type_ids_off as u32,
        proto_ids_size: 0,
        proto_ids_off: 0,
        field_ids_size: 0,
        field_ids_off: 0,
        method_ids_size: n as u32,
        method_ids_off: method_ids_off as u32,
        class_defs_size: 1,
        class_defs_off: class_defs_off as u32,
        data_size: data.len() as u32,
        data_off: data_off as u32,
    };

    let mut bytes = vec![];
    header.write(&mut bytes);
    for off in &string_offs {
        write_u4(&mut bytes, *off as u32);
    }
    write_u4(&mut bytes, 0); // type 0 -> string 0 ("LFixture;")
    for i in 0..n {
        write_u2(&mut bytes, 0); // class_idx
        write_u2(&mut bytes, 0); // proto_idx
        write_u4(&mut bytes, (i + 1) as u32); // name_idx
    }
    // class_def_item
    write_u4(&mut bytes, 0); // class_idx
    write_u4(&mut bytes, 1); // access_flags
    write_u4(&mut bytes, NO_INDEX); // superclass_idx
    write_u4(&mut bytes, 0); // interfaces_off
    write_u4(&mut bytes, NO_INDEX); // source_file_idx
    write_u4(&mut bytes, 0); // annotations_off
    write_u4(&mut bytes, class_data_off as u32);
    write_u4(&mut bytes, 0); // static_values_off

    write_x(&mut bytes, &data);
    seal_dex(&mut bytes);
    DexFixture { bytes, insns_offs }
}

/// Recomputes the SHA-1 signature and adler-32 checksum of a dex buffer,
/// independently of the production writer.
pub(crate) fn seal_dex(bytes: &mut [u8]) {
    let mut hasher = Sha1::new();
    hasher.update(&bytes[32..]);
    let signature = hasher.finalize();
    bytes[12..32].copy_from_slice(&signature);
    let checksum = adler32_slice(&bytes[12..]);
    bytes[8..12].copy_from_slice(&checksum.to_le_bytes());
}

/// Encodes a quicken side-table. Each group is `(method_idx, records)` with
/// records of `(code_off, original_bytes)`.
pub(crate) fn build_quicken_table(groups: &[(u32, Vec<(u32, Vec<u8>)>)]) -> Vec<u8> {
    let mut bytes = vec![];
    write_u4(&mut bytes, groups.len() as u32);
    for (method_idx, records) in groups {
        write_u4(&mut bytes, *method_idx);
        write_u4(&mut bytes, records.len() as u32);
        for (code_off, original) in records {
            write_u4(&mut bytes, *code_off);
            write_u2(&mut bytes, original.len() as u16);
            write_x(&mut bytes, original);
        }
    }
    bytes
}

/// Assembles a sealed vdex container from `(dex bytes, side-table bytes)`
/// pairs.
pub(crate) fn build_vdex(records: &[(&[u8], &[u8])]) -> Vec<u8> {
    let section_table_off = 16;
    let payload_off = section_table_off + 16 * records.len();

    let mut payload = vec![];
    let mut sections = vec![];
    for (dex, table) in records {
        while (payload_off + payload.len()) % 4 != 0 {
            payload.push(0);
        }
        let dex_off = payload_off + payload.len();
        payload.extend_from_slice(dex);
        let table_off = payload_off + payload.len();
        payload.extend_from_slice(table);
        sections.push((dex_off as u32, dex.len() as u32, table_off as u32, table.len() as u32));
    }

    let mut bytes = vec![];
    write_x(&mut bytes, b"vdex");
    write_x(&mut bytes, b"019\0");
    write_u4(&mut bytes, records.len() as u32);
    write_u4(&mut bytes, 0); // checksum, patched below
    for (dex_off, dex_size, table_off, table_size) in sections {
        write_u4(&mut bytes, dex_off);
        write_u4(&mut bytes, dex_size);
        write_u4(&mut bytes, table_off);
        write_u4(&mut bytes, table_size);
    }
    write_x(&mut bytes, &payload);

    let crc = crc32fast::hash(&bytes[16..]);
    bytes[12..16].copy_from_slice(&crc.to_le_bytes());
    bytes
}
