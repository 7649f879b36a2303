// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use crate::{
    format::{Node, Visitor, descriptor::FlashRegion, volume},
    visitors::Result,
};

/// Re-derive sizes, checksums and signatures and record every disagreement.
/// Never fails on a finding; callers decide what is fatal.
#[derive(Clone, Debug, Default)]
pub struct Validate {
    pub findings: Vec<String>,
    polarity: Option<u8>,
}

impl Validate {
    pub fn is_ok(&self) -> bool {
        self.findings.is_empty()
    }

    fn region(&mut self, name: &str, region: Option<&FlashRegion>) {
        if let Some(r) = region
            && !r.valid()
        {
            self.findings.push(format!(
                "{name} region: invalid bounds (base {:#x}, limit {:#x})",
                r.base, r.limit,
            ));
        }
    }
}

impl Visitor for Validate {
    fn visit(&mut self, mut node: Node<'_>) -> Result<()> {
        match &node {
            Node::FlashDescriptor(ifd) => self.findings.extend(ifd.validate()),
            Node::BiosRegion(r) => self.region("BIOS", r.flash_region.as_ref()),
            Node::MeRegion(r) => self.region("ME", r.flash_region.as_ref()),
            Node::RawRegion(r) => {
                let name = r.region_type.to_string();
                self.region(&name, r.flash_region.as_ref());
            }
            Node::FirmwareVolume(fv) => {
                let at = fv.fv_offset;

                if !fv.signature_ok() {
                    self.findings.push(format!(
                        "Volume at {at:#x}: missing {:?} signature",
                        bstr::BStr::new(volume::SIGNATURE),
                    ));
                }
                if !fv.checksum_ok() {
                    self.findings.push(format!("Volume at {at:#x}: header checksum mismatch"));
                }
                if fv.length != fv.buf.len() as u64 {
                    self.findings.push(format!(
                        "Volume at {at:#x}: length field {:#x} does not match size {:#x}",
                        fv.length,
                        fv.buf.len(),
                    ));
                }
                if fv.revision != volume::REVISION {
                    self.findings.push(format!("Volume at {at:#x}: unexpected revision {}", fv.revision));
                }

                let polarity = fv.polarity();
                match self.polarity {
                    None => self.polarity = Some(polarity),
                    Some(p) if p != polarity => self.findings.push(format!(
                        "Volume at {at:#x}: erase polarity {polarity:#04x} differs from {p:#04x}"
                    )),
                    Some(_) => {}
                }
            }
            Node::File(f) => {
                if f.extended_size != f.buf.len() as u64 {
                    self.findings.push(format!(
                        "File {}: size field {:#x} does not match size {:#x}",
                        f.guid,
                        f.extended_size,
                        f.buf.len(),
                    ));
                }
                if !f.header_checksum_ok() {
                    self.findings.push(format!("File {}: header checksum mismatch", f.guid));
                }
                if !f.body_checksum_ok() {
                    self.findings.push(format!("File {}: body checksum mismatch", f.guid));
                }
            }
            Node::Section(s) => {
                if s.extended_size != s.buf.len() as u64 {
                    self.findings.push(format!(
                        "{} section: size field {:#x} does not match size {:#x}",
                        s.section_type,
                        s.extended_size,
                        s.buf.len(),
                    ));
                }
            }
            Node::FlashImage(_) | Node::BiosPadding(_) | Node::NVarStore(_) | Node::NVar(_) => {}
        }

        node.apply_children(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        format::{
            Firmware,
            file::{File, FileType},
            volume::FirmwareVolume,
        },
        guid::Guid,
    };

    #[test]
    fn clean_volume() {
        let fv = FirmwareVolume::new_empty(0x1000, Guid([5; 16]), 0xff).unwrap();
        let mut validate = Validate::default();
        Firmware::FirmwareVolume(fv).apply(&mut validate).unwrap();

        assert!(validate.is_ok(), "{:?}", validate.findings);
    }

    #[test]
    fn corrupt_file_checksum() {
        let mut file = File::new_raw(Guid([6; 16]), FileType::RAW, b"data", 0xff).unwrap();
        file.buf[16] ^= 0x01;

        let mut validate = Validate::default();
        Firmware::File(file).apply(&mut validate).unwrap();

        assert_eq!(validate.findings.len(), 1);
        assert!(validate.findings[0].contains("header checksum"));
    }

    #[test]
    fn polarity_across_volumes() {
        let mut validate = Validate::default();
        for polarity in [0xff, 0x00] {
            let fv = FirmwareVolume::new_empty(0x1000, Guid([5; 16]), polarity).unwrap();
            Firmware::FirmwareVolume(fv).apply(&mut validate).unwrap();
        }

        assert_eq!(validate.findings.len(), 1);
        assert!(validate.findings[0].contains("erase polarity"));
    }
}
