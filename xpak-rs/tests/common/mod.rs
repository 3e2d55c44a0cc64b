#![allow(dead_code)]

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

pub const PACKAGE_MAGIC: u32 = 0x4950414B;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn align(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

/// Deterministic payload for `id`.
pub fn payload(id: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| (id as usize).wrapping_mul(31).wrapping_add(i) as u8).collect()
}

/// Header shared by the XSUB generations, 2024 bytes long.
pub fn xsub_header(archive_type: u64, hash_count: u64, hash_offset: u64) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(PACKAGE_MAGIC).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(0xB).unwrap();
    out.write_u64::<LittleEndian>(0).unwrap();
    out.write_u64::<LittleEndian>(archive_type).unwrap();
    out.write_u64::<LittleEndian>(0).unwrap();
    out.resize(out.len() + 1896, 0);
    for field in [0, 0, 0, hash_count, hash_offset, 0, 0, 0, 0, 0, 0, 0] {
        out.write_u64::<LittleEndian>(field).unwrap();
    }
    out
}

/// An XSUB object made of one group holding a single raw block.
pub fn xsub_object(id: u64, data: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; 2];
    out.write_u64::<LittleEndian>(id).unwrap();
    out.resize(22, 0);
    out.write_u8(1).unwrap();
    out.write_u8(0).unwrap();
    out.write_u32::<LittleEndian>(data.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(data.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(48).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();
    out.resize(48, 0);
    out.extend_from_slice(data);
    out
}

pub fn xsub_packed(offset: u64, size: u64, flag: u64) -> u64 {
    ((offset >> 7) << 32) | (size << 1) | flag
}

fn write_xsub_records(out: &mut Vec<u8>, v2: bool, records: &[(u64, u64)]) {
    for (id, packed) in records {
        out.write_u64::<LittleEndian>(*id).unwrap();
        out.write_u64::<LittleEndian>(*packed).unwrap();
        if v2 {
            out.write_u32::<LittleEndian>(0).unwrap();
        }
    }
}

/// An XSUB package holding its own data (type 3), or a type 1 package and its `data` sibling.
///
/// Returns `(package, data file)`; the data file is empty unless `archive_type` is 1.
pub fn xsub_package(v2: bool, archive_type: u64, objects: &[(u64, Vec<u8>)]) -> (Vec<u8>, Vec<u8>) {
    let split = archive_type == 1;
    let mut data = if split { Vec::new() } else { vec![0u8; 0x800] };
    let mut records = Vec::new();
    for (id, bytes) in objects {
        let object = xsub_object(*id, bytes);
        records.push((*id, xsub_packed(data.len() as u64, object.len() as u64, 0)));
        data.extend(object);
        data.resize(align(data.len(), 0x80), 0);
    }

    let hash_offset = if split { 0x800 } else { data.len() };
    let header = xsub_header(archive_type, records.len() as u64, hash_offset as u64);
    let (mut package, data_file) = if split {
        (vec![0u8; 0x800], data)
    } else {
        (data, Vec::new())
    };
    package[..header.len()].copy_from_slice(&header);
    write_xsub_records(&mut package, v2, &records);
    (package, data_file)
}

/// A CDN index package listing `(id, stored size, flag)` with no object data.
pub fn cdn_index(v2: bool, entries: &[(u64, u64, u64)]) -> Vec<u8> {
    let mut package = xsub_header(2, entries.len() as u64, 0x800);
    package.resize(0x800, 0);
    let records: Vec<_> = entries
        .iter()
        .map(|(id, size, flag)| (*id, xsub_packed(0, *size, *flag)))
        .collect();
    write_xsub_records(&mut package, v2, &records);
    package
}

/// An XPAK object: one 128-byte block header and a single raw block, padded to 0x80.
pub fn xpak_object(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(1).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();
    out.write_u32::<LittleEndian>(data.len() as u32).unwrap();
    out.resize(128, 0);
    out.write_all(data).unwrap();
    out.resize(align(out.len(), 0x80), 0);
    out
}

/// A version 0xB XPAK with its data at 0x200 and the hash table after it.
pub fn xpak_package(objects: &[(u64, Vec<u8>)]) -> Vec<u8> {
    const DATA_OFFSET: usize = 0x200;
    let mut data = Vec::new();
    let mut records = Vec::new();
    for (id, bytes) in objects {
        let object = xpak_object(bytes);
        records.push((*id, data.len() as u64, object.len() as u64));
        data.extend(object);
    }

    let hash_offset = DATA_OFFSET + data.len();
    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(PACKAGE_MAGIC).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u16::<LittleEndian>(0xB).unwrap();
    out.resize(24, 0);
    let fields = [
        0,
        DATA_OFFSET as u64,
        data.len() as u64,
        records.len() as u64,
        hash_offset as u64,
        0,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    for field in fields {
        out.write_u64::<LittleEndian>(field).unwrap();
    }
    out.resize(DATA_OFFSET, 0);
    out.extend(data);
    for (id, offset, size) in records {
        out.write_u64::<LittleEndian>(id).unwrap();
        out.write_u64::<LittleEndian>(offset).unwrap();
        out.write_u64::<LittleEndian>(size).unwrap();
    }
    out
}

/// An IPAK with an entry segment and a data segment of single raw-block objects.
pub fn ipak_package(objects: &[(u64, Vec<u8>)]) -> Vec<u8> {
    const ENTRIES_OFFSET: usize = 0x80;
    let data_offset = align(ENTRIES_OFFSET + objects.len() * 16, 0x80);

    let mut data = Vec::new();
    let mut entries = Vec::new();
    for (id, bytes) in objects {
        let mut object = Vec::new();
        object.write_u32::<LittleEndian>(1 << 24).unwrap();
        object.write_u32::<LittleEndian>(bytes.len() as u32).unwrap();
        object.resize(128, 0);
        object.extend_from_slice(bytes);
        object.resize(align(object.len(), 0x80), 0);
        entries.push((*id, data.len() as u32, object.len() as u32));
        data.extend(object);
    }

    let mut out = Vec::new();
    out.write_u32::<LittleEndian>(PACKAGE_MAGIC).unwrap();
    out.write_u32::<LittleEndian>(5).unwrap();
    out.write_u32::<LittleEndian>((data_offset + data.len()) as u32).unwrap();
    out.write_u32::<LittleEndian>(2).unwrap();
    for (segment_type, offset, size, count) in [
        (1u32, ENTRIES_OFFSET, objects.len() * 16, objects.len()),
        (2, data_offset, data.len(), 0),
    ] {
        out.write_u32::<LittleEndian>(segment_type).unwrap();
        out.write_u32::<LittleEndian>(offset as u32).unwrap();
        out.write_u32::<LittleEndian>(size as u32).unwrap();
        out.write_u32::<LittleEndian>(count as u32).unwrap();
    }
    out.resize(ENTRIES_OFFSET, 0);
    for (id, offset, size) in entries {
        out.write_u64::<LittleEndian>(id).unwrap();
        out.write_u32::<LittleEndian>(offset).unwrap();
        out.write_u32::<LittleEndian>(size).unwrap();
    }
    out.resize(data_offset, 0);
    out.extend(data);
    out
}
