// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

use tracing::info;

use crate::{
    format::{
        Firmware, Node, Visitor,
        region::{BiosElement, BiosPadding},
        volume::{self, FirmwareVolume},
    },
    guid::Guid,
    util::NumBytes,
    visitors::{Error, Result},
};

/// Carve an empty volume out of the BIOS padding that covers
/// `offset..offset + size`. Offsets are absolute within the flash image.
#[derive(Debug)]
pub struct CreateFv {
    offset: u64,
    size: u64,
    name: Guid,
    created: bool,
}

impl CreateFv {
    pub fn new(offset: u64, size: u64, name: Guid) -> Self {
        Self {
            offset,
            size,
            name,
            created: false,
        }
    }

    pub fn run(&mut self, fw: &mut Firmware) -> Result<()> {
        if self.offset % volume::FILE_ALIGNMENT as u64 != 0 {
            return Err(Error::InvalidArgument(format!(
                "Volume offset {:#x} is not {}-byte aligned",
                self.offset,
                volume::FILE_ALIGNMENT,
            )));
        }

        fw.apply(self)?;

        if !self.created {
            return Err(Error::InsufficientSpace {
                what: format!("BIOS padding at {:#x}", self.offset),
                needed: self.size,
                available: 0,
            });
        }

        Ok(())
    }
}

impl Visitor for CreateFv {
    fn visit(&mut self, mut node: Node<'_>) -> Result<()> {
        if !matches!(node, Node::BiosRegion(_)) {
            return node.apply_children(self);
        }
        let Node::BiosRegion(bios) = node else {
            return Ok(());
        };
        if self.created {
            return Ok(());
        }

        let end = self.offset.checked_add(self.size).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "Volume range {:#x} + {:#x} overflows",
                self.offset, self.size,
            ))
        })?;
        let polarity = bios.polarity().unwrap_or(0xff);

        let Some((index, padding)) = bios.elements.iter().enumerate().find_map(|(i, e)| match e {
            BiosElement::Padding(p)
                if p.offset <= self.offset && end <= p.offset + p.buf.len() as u64 =>
            {
                Some((i, p.clone()))
            }
            _ => None,
        }) else {
            return Ok(());
        };

        let mut fv = FirmwareVolume::new_empty(self.size, self.name, polarity)?;
        fv.fv_offset = self.offset;

        let split = (self.offset - padding.offset) as usize;
        let rest = split + self.size as usize;

        let mut replacement = vec![];
        if split > 0 {
            replacement.push(BiosElement::Padding(BiosPadding {
                buf: padding.buf[..split].to_vec(),
                offset: padding.offset,
                ..Default::default()
            }));
        }
        replacement.push(BiosElement::Volume(fv));
        if rest < padding.buf.len() {
            replacement.push(BiosElement::Padding(BiosPadding {
                buf: padding.buf[rest..].to_vec(),
                offset: end,
                ..Default::default()
            }));
        }

        bios.elements.splice(index..=index, replacement);
        self.created = true;

        info!("Created {:?} volume {} at {:#x}", NumBytes(self.size), self.name, self.offset);

        Ok(())
    }
}
