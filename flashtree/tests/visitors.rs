// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::HashMap, io};

use flashtree::{
    format::{
        self, Context, Firmware,
        file::{File, FileType},
        section::{Section, SectionType},
        volume::FirmwareVolume,
    },
    guid::{self, Guid},
    visitors::{
        Assemble, AttachBuffers, Count, ExtractBuffers, Flatten, Predicate, Remove, SetOffsets,
        Validate,
    },
};

fn file(id: u8, name: &str, compress: bool) -> File {
    let mut sections = vec![
        Section::new_leaf(SectionType::PE32, &[id; 300]).unwrap(),
        Section::new_ui(name).unwrap(),
    ];
    if compress {
        sections = vec![Section::new_guid_defined(guid::LZMA, sections).unwrap()];
    }

    File::new(Guid([id; 16]), FileType::DRIVER, sections, 0xff).unwrap()
}

/// Two volumes separated by padding.
fn image() -> Vec<u8> {
    let mut buf = vec![];

    for (i, names) in [["PeiCore", "Platform"], ["DxeCore", "Shell"]].iter().enumerate() {
        let mut fv = FirmwareVolume::new_empty(0x3000, Guid([0xa0 + i as u8; 16]), 0xff).unwrap();
        for (j, name) in names.iter().enumerate() {
            fv.files.push(file((i * 2 + j) as u8 + 1, name, j == 1));
        }
        fv.assemble(false).unwrap();

        buf.extend_from_slice(&fv.buf);
        buf.resize(buf.len() + 0x1000, 0xff);
    }

    buf
}

fn parse(buf: &[u8]) -> Firmware {
    format::parse(buf, &mut Context::default()).unwrap()
}

#[test]
fn extract_serialize_attach_is_identity() {
    let original = image();
    let mut fw = parse(&original);

    let mut store = HashMap::new();
    fw.apply(&mut ExtractBuffers::new(|key: &str, data: &[u8]| {
        assert!(store.insert(key.to_owned(), data.to_vec()).is_none(), "Duplicate key: {key}");
        Ok(())
    }))
    .unwrap();

    let json = serde_json::to_string(&fw).unwrap();
    let mut restored: Firmware = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.type_name(), "BIOSRegion");
    assert!(restored.buf().is_empty());

    restored
        .apply(&mut AttachBuffers::new(|key: &str| {
            store
                .get(key)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, key.to_owned()))
        }))
        .unwrap();
    restored.apply(&mut Assemble::new()).unwrap();

    assert_eq!(restored.buf(), original.as_slice());
}

#[test]
fn json_uses_stable_tags() {
    let fw = parse(&image());
    let value = serde_json::to_value(&fw).unwrap();

    assert_eq!(value["Type"], "BIOSRegion");
    assert_eq!(value["Value"]["elements"][0]["Type"], "FirmwareVolume");
    assert_eq!(value["Value"]["elements"][1]["Type"], "BIOSPadding");
}

#[test]
fn count_and_flatten() {
    let mut fw = parse(&image());

    let mut count = Count::default();
    fw.apply(&mut count).unwrap();
    assert_eq!(count.firmware_types["FirmwareVolume"], 2);
    assert_eq!(count.firmware_types["File"], 4);
    assert_eq!(count.firmware_types["BIOSPadding"], 2);
    assert_eq!(count.section_types["PE32"], 4);
    assert_eq!(count.section_types["GUID_DEFINED"], 2);

    let mut flatten = Flatten::default();
    fw.apply(&mut flatten).unwrap();
    assert_eq!(flatten.nodes[0].parent, None);
    for (i, node) in flatten.nodes.iter().enumerate().skip(1) {
        let parent = node.parent.unwrap();
        assert!(parent < i);
        assert_eq!(flatten.nodes[parent].depth + 1, node.depth);
    }
}

#[test]
fn edit_then_validate() {
    let mut fw = parse(&image());

    Remove::new(Predicate::by_name("Shell|Platform").unwrap(), false)
        .run(&mut fw)
        .unwrap();
    fw.apply(&mut Assemble::new()).unwrap();
    fw.apply(&mut SetOffsets).unwrap();

    let mut reparsed = parse(fw.buf());
    let mut validate = Validate::default();
    reparsed.apply(&mut validate).unwrap();
    assert!(validate.is_ok(), "{:?}", validate.findings);

    let mut count = Count::default();
    reparsed.apply(&mut count).unwrap();
    assert_eq!(count.firmware_types["File"], 2);
    assert!(!count.section_types.contains_key("GUID_DEFINED"));
}
