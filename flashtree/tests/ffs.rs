// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use assert_matches::assert_matches;

use flashtree::{
    format::{
        self, Context, Firmware,
        depex::{DepExOp, DepExOpCode},
        file::{File, FileType},
        section::{Section, SectionType},
        volume::FirmwareVolume,
    },
    guid::{self, Guid},
    visitors::{Assemble, Find, Insert, Predicate, Preposition},
};

const PROTOCOL: &str = "01234567-89AB-CDEF-0123-456789ABCDEF";

fn driver(name: &str, compress: bool) -> File {
    let depex = DepExOp::parse_expression(&format!("{PROTOCOL} {PROTOCOL}")).unwrap();

    let mut sections = vec![
        Section::new_depex(SectionType::DXE_DEPEX, depex).unwrap(),
        Section::new_leaf(SectionType::PE32, &b"MZ".repeat(500)).unwrap(),
        Section::new_ui(name).unwrap(),
        Section::new_version(7, "1.0").unwrap(),
    ];
    if compress {
        sections = vec![Section::new_guid_defined(guid::LZMA, sections).unwrap()];
    }

    File::new(Guid([0x7e; 16]), FileType::DRIVER, sections, 0xff).unwrap()
}

fn find_one(fw: &mut Firmware, name: &str) -> File {
    let mut find = Find::new(Predicate::by_name(name).unwrap());
    fw.apply(&mut find).unwrap();

    let [Firmware::File(file)] = find.matches.as_slice() else {
        panic!("Expected one file: {:?}", find.matches);
    };
    file.clone()
}

fn flatten_sections(sections: &[Section]) -> Vec<&Section> {
    sections
        .iter()
        .flat_map(|s| std::iter::once(s).chain(flatten_sections(&s.encapsulated)))
        .collect()
}

#[test]
fn built_file_survives_insertion() {
    for compress in [false, true] {
        let fv = FirmwareVolume::new_empty(0x4000, Guid([0x10; 16]), 0xff).unwrap();
        let mut fw = format::parse(&fv.buf, &mut Context::default()).unwrap();

        let fv_name = Guid([0x10; 16]).to_string();
        Insert::new(
            driver("MyDriver", compress),
            Preposition::End,
            Predicate::by_volume_or_name(&fv_name).unwrap(),
        )
        .run(&mut fw)
        .unwrap();
        fw.apply(&mut Assemble::new()).unwrap();

        let mut reparsed = format::parse(fw.buf(), &mut Context::default()).unwrap();
        let file = find_one(&mut reparsed, "MyDriver");

        assert!(file.header_checksum_ok());
        assert!(file.body_checksum_ok());

        let sections = flatten_sections(&file.sections);
        let depex = sections
            .iter()
            .find(|s| s.section_type == SectionType::DXE_DEPEX)
            .unwrap();
        let op_codes = depex.depex.iter().map(|o| o.op_code).collect::<Vec<_>>();
        assert_eq!(
            op_codes,
            [DepExOpCode::Push, DepExOpCode::Push, DepExOpCode::And, DepExOpCode::End]
        );

        let version = sections
            .iter()
            .find(|s| s.section_type == SectionType::VERSION)
            .unwrap();
        assert_eq!(version.build_number, Some(7));
        assert_eq!(version.version.as_deref(), Some("1.0"));

        let pe32 = sections
            .iter()
            .find(|s| s.section_type == SectionType::PE32)
            .unwrap();
        assert_eq!(pe32.data(), b"MZ".repeat(500).as_slice());
    }
}

#[test]
fn depex_expressions() {
    assert_eq!(
        DepExOp::parse_expression("TRUE").unwrap(),
        [DepExOp::new(DepExOpCode::True), DepExOp::new(DepExOpCode::End)]
    );
    assert_matches!(
        DepExOp::parse_expression("ABC"),
        Err(format::Error::Guid(guid::Error::BadLength(s))) if s == "ABC"
    );
    assert_matches!(DepExOp::parse_expression("  "), Err(format::Error::DepExEmpty));
}
