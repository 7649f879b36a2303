// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

//! The node tree. [`Firmware`] owns a parsed tree, [`Node`] is the borrowed
//! view that [`Visitor`]s receive for every node in it.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    format::{
        Error, Result,
        descriptor::{self, FlashDescriptor},
        file::File,
        flash::FlashImage,
        me::MeRegion,
        nvram::{NVar, NVarStore},
        region::{BiosPadding, BiosRegion, RawRegion},
        section::Section,
        volume::FirmwareVolume,
    },
    visitors,
};

/// State shared by every parser working on the same image.
#[derive(Clone, Debug, Default)]
pub struct Context {
    polarity: Option<u8>,
    /// Log polarity mismatches between volumes instead of failing.
    pub allow_polarity_mismatch: bool,
}

impl Context {
    /// Erase polarity of the image. Until a volume has been seen, erased
    /// flash is assumed to read as `0xff`.
    pub fn polarity(&self) -> u8 {
        self.polarity.unwrap_or(0xff)
    }

    pub fn polarity_known(&self) -> bool {
        self.polarity.is_some()
    }

    /// Record the polarity of a volume. The first volume decides, every later
    /// one must agree.
    pub fn set_polarity(&mut self, polarity: u8) -> Result<()> {
        match self.polarity {
            None => {
                debug!("Erase polarity is {polarity:#04x}");
                self.polarity = Some(polarity);
            }
            Some(expected) if expected != polarity => {
                if !self.allow_polarity_mismatch {
                    return Err(Error::PolarityMismatch {
                        expected,
                        actual: polarity,
                    });
                }

                warn!("Volume polarity {polarity:#04x} differs from image polarity {expected:#04x}");
            }
            Some(_) => {}
        }

        Ok(())
    }
}

/// An owned node of any type. Serialized with the node type as the tag.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Value")]
pub enum Firmware {
    FlashImage(FlashImage),
    FlashDescriptor(FlashDescriptor),
    #[serde(rename = "BIOSRegion")]
    BiosRegion(BiosRegion),
    #[serde(rename = "BIOSPadding")]
    BiosPadding(BiosPadding),
    #[serde(rename = "MERegion")]
    MeRegion(MeRegion),
    RawRegion(RawRegion),
    FirmwareVolume(FirmwareVolume),
    File(File),
    Section(Section),
    NVarStore(NVarStore),
    NVar(NVar),
}

impl Firmware {
    pub fn node(&mut self) -> Node<'_> {
        match self {
            Self::FlashImage(n) => Node::FlashImage(n),
            Self::FlashDescriptor(n) => Node::FlashDescriptor(n),
            Self::BiosRegion(n) => Node::BiosRegion(n),
            Self::BiosPadding(n) => Node::BiosPadding(n),
            Self::MeRegion(n) => Node::MeRegion(n),
            Self::RawRegion(n) => Node::RawRegion(n),
            Self::FirmwareVolume(n) => Node::FirmwareVolume(n),
            Self::File(n) => Node::File(n),
            Self::Section(n) => Node::Section(n),
            Self::NVarStore(n) => Node::NVarStore(n),
            Self::NVar(n) => Node::NVar(n),
        }
    }

    pub fn apply(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        v.visit(self.node())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::FlashImage(_) => "FlashImage",
            Self::FlashDescriptor(_) => "FlashDescriptor",
            Self::BiosRegion(_) => "BIOSRegion",
            Self::BiosPadding(_) => "BIOSPadding",
            Self::MeRegion(_) => "MERegion",
            Self::RawRegion(_) => "RawRegion",
            Self::FirmwareVolume(_) => "FirmwareVolume",
            Self::File(_) => "File",
            Self::Section(_) => "Section",
            Self::NVarStore(_) => "NVarStore",
            Self::NVar(_) => "NVar",
        }
    }

    pub fn buf(&self) -> &[u8] {
        match self {
            Self::FlashImage(n) => &n.buf,
            Self::FlashDescriptor(n) => &n.buf,
            Self::BiosRegion(n) => &n.buf,
            Self::BiosPadding(n) => &n.buf,
            Self::MeRegion(n) => &n.buf,
            Self::RawRegion(n) => &n.buf,
            Self::FirmwareVolume(n) => &n.buf,
            Self::File(n) => &n.buf,
            Self::Section(n) => &n.buf,
            Self::NVarStore(n) => &n.buf,
            Self::NVar(n) => &n.buf,
        }
    }
}

/// Mutable view of one node, handed to [`Visitor::visit`].
#[derive(Debug)]
pub enum Node<'a> {
    FlashImage(&'a mut FlashImage),
    FlashDescriptor(&'a mut FlashDescriptor),
    BiosRegion(&'a mut BiosRegion),
    BiosPadding(&'a mut BiosPadding),
    MeRegion(&'a mut MeRegion),
    RawRegion(&'a mut RawRegion),
    FirmwareVolume(&'a mut FirmwareVolume),
    File(&'a mut File),
    Section(&'a mut Section),
    NVarStore(&'a mut NVarStore),
    NVar(&'a mut NVar),
}

macro_rules! each_node {
    ($node:expr, $n:ident => $body:expr) => {
        match $node {
            Node::FlashImage($n) => $body,
            Node::FlashDescriptor($n) => $body,
            Node::BiosRegion($n) => $body,
            Node::BiosPadding($n) => $body,
            Node::MeRegion($n) => $body,
            Node::RawRegion($n) => $body,
            Node::FirmwareVolume($n) => $body,
            Node::File($n) => $body,
            Node::Section($n) => $body,
            Node::NVarStore($n) => $body,
            Node::NVar($n) => $body,
        }
    };
}

impl Node<'_> {
    /// Visit the direct children of this node.
    pub fn apply_children(&mut self, v: &mut dyn Visitor) -> visitors::Result<()> {
        each_node!(self, n => n.apply_children(v))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::FlashImage(_) => "FlashImage",
            Self::FlashDescriptor(_) => "FlashDescriptor",
            Self::BiosRegion(_) => "BIOSRegion",
            Self::BiosPadding(_) => "BIOSPadding",
            Self::MeRegion(_) => "MERegion",
            Self::RawRegion(_) => "RawRegion",
            Self::FirmwareVolume(_) => "FirmwareVolume",
            Self::File(_) => "File",
            Self::Section(_) => "Section",
            Self::NVarStore(_) => "NVarStore",
            Self::NVar(_) => "NVar",
        }
    }

    pub fn buf(&self) -> &[u8] {
        each_node!(self, n => &n.buf)
    }

    pub fn set_buf(&mut self, buf: Vec<u8>) {
        each_node!(self, n => n.buf = buf)
    }

    pub fn take_buf(&mut self) -> Vec<u8> {
        each_node!(self, n => std::mem::take(&mut n.buf))
    }

    pub fn extract_path(&self) -> &str {
        each_node!(self, n => &n.extract_path)
    }

    pub fn set_extract_path(&mut self, path: String) {
        each_node!(self, n => n.extract_path = path)
    }

    /// Owned copy of the node and its subtree.
    pub fn to_firmware(&self) -> Firmware {
        match self {
            Self::FlashImage(n) => Firmware::FlashImage((**n).clone()),
            Self::FlashDescriptor(n) => Firmware::FlashDescriptor((**n).clone()),
            Self::BiosRegion(n) => Firmware::BiosRegion((**n).clone()),
            Self::BiosPadding(n) => Firmware::BiosPadding((**n).clone()),
            Self::MeRegion(n) => Firmware::MeRegion((**n).clone()),
            Self::RawRegion(n) => Firmware::RawRegion((**n).clone()),
            Self::FirmwareVolume(n) => Firmware::FirmwareVolume((**n).clone()),
            Self::File(n) => Firmware::File((**n).clone()),
            Self::Section(n) => Firmware::Section((**n).clone()),
            Self::NVarStore(n) => Firmware::NVarStore((**n).clone()),
            Self::NVar(n) => Firmware::NVar((**n).clone()),
        }
    }
}

/// An operation over the node tree. Implementations decide per node whether
/// and when to descend with [`Node::apply_children`].
pub trait Visitor {
    fn visit(&mut self, node: Node<'_>) -> visitors::Result<()>;
}

/// Parse a complete image. Images with a flash descriptor become a
/// [`FlashImage`], anything else is treated as a bare BIOS region.
pub fn parse(buf: &[u8], ctx: &mut Context) -> Result<Firmware> {
    if descriptor::find_map(buf).is_some() {
        debug!("Found flash descriptor");
        FlashImage::parse(buf, ctx).map(Firmware::FlashImage)
    } else {
        debug!("No flash descriptor, parsing as BIOS region");
        BiosRegion::parse(buf, None, ctx).map(Firmware::BiosRegion)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::guid::Guid;

    #[test]
    fn polarity_first_wins() {
        let mut ctx = Context::default();
        assert_eq!(ctx.polarity(), 0xff);
        assert!(!ctx.polarity_known());

        ctx.set_polarity(0x00).unwrap();
        ctx.set_polarity(0x00).unwrap();
        assert_eq!(ctx.polarity(), 0x00);
        assert_matches!(
            ctx.set_polarity(0xff),
            Err(Error::PolarityMismatch {
                expected: 0x00,
                actual: 0xff
            })
        );
    }

    #[test]
    fn bare_bios_image() {
        let fv = FirmwareVolume::new_empty(0x1000, Guid([0x22; 16]), 0xff).unwrap();
        let mut fw = parse(&fv.buf, &mut Context::default()).unwrap();

        assert_eq!(fw.type_name(), "BIOSRegion");
        assert_eq!(fw.node().type_name(), "BIOSRegion");

        let json = serde_json::to_value(&fw).unwrap();
        assert_eq!(json["Type"], "BIOSRegion");
        assert_eq!(json["Value"]["elements"][0]["Type"], "FirmwareVolume");
    }
}
