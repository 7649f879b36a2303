// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use assert_matches::assert_matches;

use flashtree::{
    format::{
        self, Context, Firmware,
        descriptor::{self, FlashRegion, FlashRegionType},
        file::{File, FileType},
        region::{BiosElement, Region},
        section::Section,
        volume::FirmwareVolume,
    },
    guid::Guid,
    visitors::{self, Assemble, TightenMe, Validate},
};

const FLASH_SIZE: usize = 0x10000;
const ME_START: u64 = 0x1000;
const BIOS_START: u64 = 0x5000;

/// `$FPT` table with one partition at 0x100..0x1800.
fn me_region(len: usize) -> Vec<u8> {
    let mut buf = vec![0xff; len];

    let mut header = vec![];
    header.extend_from_slice(b"$FPT");
    header.extend_from_slice(&1u32.to_le_bytes());
    header.extend_from_slice(&[0x20, 0x10, 0x20, 0x00]);
    header.resize(32, 0);

    let mut entry = vec![];
    entry.extend_from_slice(b"FTPR");
    entry.extend_from_slice(&[0; 4]);
    entry.extend_from_slice(&0x100u32.to_le_bytes());
    entry.extend_from_slice(&0x1700u32.to_le_bytes());
    entry.resize(32, 0);

    buf[..32].copy_from_slice(&header);
    buf[32..64].copy_from_slice(&entry);
    buf
}

fn bios_volume() -> FirmwareVolume {
    let mut fv = FirmwareVolume::new_empty(0x4000, Guid([0x42; 16]), 0xff).unwrap();
    let sections = vec![
        Section::new_leaf(format::section::SectionType::PE32, &[0x90; 256]).unwrap(),
        Section::new_ui("Payload").unwrap(),
    ];
    fv.files
        .push(File::new(Guid([0x11; 16]), FileType::DRIVER, sections, 0xff).unwrap());
    fv.assemble(false).unwrap();
    fv
}

fn flash_image() -> Vec<u8> {
    let me = FlashRegion::from_offsets(ME_START, BIOS_START).unwrap();
    let bios = FlashRegion::from_offsets(BIOS_START, FLASH_SIZE as u64).unwrap();
    let ifd = descriptor::build(&[(FlashRegionType::Me, me), (FlashRegionType::Bios, bios)]).unwrap();

    let mut buf = ifd.buf;
    buf.extend_from_slice(&me_region((BIOS_START - ME_START) as usize));
    buf.extend_from_slice(&bios_volume().buf);
    buf.resize(FLASH_SIZE, 0xff);
    buf
}

fn parse(buf: &[u8]) -> Firmware {
    format::parse(buf, &mut Context::default()).unwrap()
}

#[test]
fn parse_and_reassemble_unchanged() {
    let buf = flash_image();
    let mut fw = parse(&buf);

    let Firmware::FlashImage(flash) = &fw else {
        panic!("Not a flash image: {}", fw.type_name());
    };
    assert_eq!(flash.regions.len(), 2);
    assert_matches!(flash.region(FlashRegionType::Me), Some(Region::Me(me)) if me.free_space_offset == 0x1800);
    assert_matches!(flash.region(FlashRegionType::Bios), Some(Region::Bios(b)) if b.volumes().count() == 1);

    let mut validate = Validate::default();
    fw.apply(&mut validate).unwrap();
    assert!(validate.is_ok(), "{:?}", validate.findings);

    fw.apply(&mut Assemble::new()).unwrap();
    assert_eq!(fw.buf(), buf.as_slice());
}

#[test]
fn image_without_descriptor_is_bios_region() {
    let buf = bios_volume().buf;
    let fw = parse(&buf);

    assert_matches!(fw, Firmware::BiosRegion(r) if r.flash_region.is_none() && r.volumes().count() == 1);
}

#[test]
fn tighten_me_moves_space_to_bios() {
    let mut fw = parse(&flash_image());

    let mut tighten = TightenMe::default();
    fw.apply(&mut tighten).unwrap();
    assert_eq!(tighten.reclaimed, 0x2000);

    fw.apply(&mut Assemble::new()).unwrap();
    assert_eq!(fw.buf().len(), FLASH_SIZE);

    let reparsed = parse(fw.buf());
    let Firmware::FlashImage(flash) = &reparsed else {
        panic!("Not a flash image");
    };

    let me = flash.ifd.region(FlashRegionType::Me).unwrap();
    let bios = flash.ifd.region(FlashRegionType::Bios).unwrap();
    assert_eq!((me.base_offset(), me.end_offset()), (ME_START, 0x3000));
    assert_eq!((bios.base_offset(), bios.end_offset()), (0x3000, FLASH_SIZE as u64));

    let Some(Region::Bios(region)) = flash.region(FlashRegionType::Bios) else {
        panic!("BIOS region missing");
    };
    assert_matches!(region.elements.first(), Some(BiosElement::Padding(p)) if p.buf.len() == 0x2000);
    let fv = region.volumes().next().unwrap();
    assert_eq!(fv.files[0].name(), Some("Payload"));
}

#[test]
fn tighten_me_requires_flash_image() {
    let mut fw = parse(&bios_volume().buf);

    assert_matches!(
        fw.apply(&mut TightenMe::default()),
        Err(visitors::Error::InvalidArgument(_))
    );
}

#[test]
fn tighten_me_requires_adjacent_regions() {
    let me = FlashRegion::from_offsets(ME_START, 0x4000).unwrap();
    let bios = FlashRegion::from_offsets(BIOS_START, FLASH_SIZE as u64).unwrap();
    let ifd = descriptor::build(&[(FlashRegionType::Me, me), (FlashRegionType::Bios, bios)]).unwrap();

    let mut buf = ifd.buf;
    buf.extend_from_slice(&me_region(0x3000));
    buf.resize(BIOS_START as usize, 0xff);
    buf.extend_from_slice(&bios_volume().buf);
    buf.resize(FLASH_SIZE, 0xff);

    let mut fw = parse(&buf);
    assert_matches!(
        fw.apply(&mut TightenMe::default()),
        Err(visitors::Error::NonContiguousLayout(_))
    );
}

#[test]
fn overlapping_regions() {
    let me = FlashRegion::from_offsets(ME_START, 0x6000).unwrap();
    let bios = FlashRegion::from_offsets(BIOS_START, FLASH_SIZE as u64).unwrap();
    let ifd = descriptor::build(&[(FlashRegionType::Me, me), (FlashRegionType::Bios, bios)]).unwrap();

    let mut buf = ifd.buf;
    buf.resize(FLASH_SIZE, 0xff);

    assert_matches!(
        format::parse(&buf, &mut Context::default()),
        Err(format::Error::OverlappingRegions(FlashRegionType::Bios))
    );
}
