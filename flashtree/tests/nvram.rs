// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use flashtree::{
    format::{
        self, Context, Firmware,
        file::{File, FileType},
        nvram::{NVarEntryType, NVarStore},
        region::BiosElement,
        volume::FirmwareVolume,
    },
    guid::{self, Guid},
    visitors::{Assemble, NVarCompact},
};

const STORE_SIZE: usize = 0x200;
const VAR_GUID: Guid = Guid([0x5a; 16]);

fn entry(attributes: u8, next: u32, body: &[u8]) -> Vec<u8> {
    let size = (10 + body.len()) as u16;

    let mut buf = b"NVAR".to_vec();
    buf.extend_from_slice(&size.to_le_bytes());
    buf.extend_from_slice(&next.to_le_bytes()[..3]);
    buf.push(attributes);
    buf.extend_from_slice(body);
    buf
}

/// `Setup` written three times through a data-only chain, plus a standalone
/// `Boot` variable and an invalidated entry.
fn store() -> Vec<u8> {
    const VALID_ASCII: u8 = 0x82;
    const DATA_ONLY: u8 = 0x88;
    const SENTINEL: u32 = 0xff_ffff;

    let setup = entry(VALID_ASCII, 0, b"\x00Setup\0v1");
    let setup_len = setup.len() as u32;
    let setup = entry(VALID_ASCII, setup_len, b"\x00Setup\0v1");
    let update1 = entry(DATA_ONLY, 12, b"v2");
    let update2 = entry(DATA_ONLY, SENTINEL, b"v3");
    let boot = entry(VALID_ASCII, SENTINEL, b"\x00Boot\0\x01\x02");
    let stale = entry(0x02, SENTINEL, b"\x00Old\0x");

    let mut buf = [setup, update1, update2, boot, stale].concat();
    buf.resize(STORE_SIZE - 16, 0xff);
    buf.extend_from_slice(VAR_GUID.bytes());
    buf
}

fn image() -> Vec<u8> {
    let mut fv = FirmwareVolume::new_empty(0x2000, Guid([0x33; 16]), 0xff).unwrap();
    fv.files
        .push(File::new_raw(guid::NVAR, FileType::RAW, &store(), 0xff).unwrap());
    fv.assemble(false).unwrap();
    fv.buf
}

fn nvar_store(fw: &Firmware) -> &NVarStore {
    let Firmware::BiosRegion(region) = fw else {
        panic!("Not a BIOS region");
    };
    let Some(BiosElement::Volume(fv)) = region.elements.first() else {
        panic!("No volume");
    };

    fv.files[0].nvar_store.as_ref().unwrap()
}

#[test]
fn store_is_found_in_nvar_file() {
    let fw = format::parse(&image(), &mut Context::default()).unwrap();
    let store = nvar_store(&fw);

    let types = store.entries.iter().map(|e| e.entry_type).collect::<Vec<_>>();
    assert_eq!(
        types,
        [
            NVarEntryType::Link,
            NVarEntryType::Link,
            NVarEntryType::Data,
            NVarEntryType::Full,
            NVarEntryType::Invalid,
        ],
    );
    assert_eq!(store.entries[2].name, "Setup");
    assert_eq!(store.entries[2].guid, VAR_GUID);
    assert_eq!(store.guid_store, [VAR_GUID]);
}

#[test]
fn compaction_keeps_latest_values() {
    let mut fw = format::parse(&image(), &mut Context::default()).unwrap();

    let mut compact = NVarCompact::default();
    fw.apply(&mut compact).unwrap();
    assert_eq!((compact.stores, compact.removed), (1, 3));

    fw.apply(&mut Assemble::new()).unwrap();
    assert_eq!(fw.buf().len(), 0x2000);

    let reparsed = format::parse(fw.buf(), &mut Context::default()).unwrap();
    let store = nvar_store(&reparsed);

    let vars = store
        .entries
        .iter()
        .map(|e| (e.name.as_str(), e.entry_type, e.data()))
        .collect::<Vec<_>>();
    assert_eq!(
        vars,
        [
            ("Setup", NVarEntryType::Full, b"v3".as_slice()),
            ("Boot", NVarEntryType::Full, b"\x01\x02".as_slice()),
        ],
    );
    assert_eq!(store.buf.len(), STORE_SIZE);
    assert_eq!(store.guid_store, [VAR_GUID]);
}
