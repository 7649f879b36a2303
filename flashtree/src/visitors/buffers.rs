// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Moving node buffers in and out of the tree. The serialized tree only
//! carries [`extract_path`] keys; these visitors pair the keys with storage
//! supplied by the caller.
//!
//! [`extract_path`]: crate::format::Node::extract_path

use std::io;

use crate::{
    format::{Node, Visitor},
    visitors::Result,
};

/// Hand every non-empty buffer to `sink` under a stable, hierarchical key and
/// record that key in the node.
pub struct ExtractBuffers<F> {
    sink: F,
    dir: String,
    index: usize,
}

impl<F: FnMut(&str, &[u8]) -> io::Result<()>> ExtractBuffers<F> {
    pub fn new(sink: F) -> Self {
        Self {
            sink,
            dir: String::new(),
            index: 0,
        }
    }
}

impl<F: FnMut(&str, &[u8]) -> io::Result<()>> Visitor for ExtractBuffers<F> {
    fn visit(&mut self, mut node: Node<'_>) -> Result<()> {
        let dir = if self.dir.is_empty() {
            node.type_name().to_owned()
        } else {
            format!("{}/{}_{}", self.dir, self.index, node.type_name())
        };
        self.index += 1;

        if node.buf().is_empty() {
            node.set_extract_path(String::new());
        } else {
            let key = format!("{dir}/body.bin");
            (self.sink)(&key, node.buf())?;
            node.set_extract_path(key);
        }

        let outer = (std::mem::replace(&mut self.dir, dir), self.index);
        self.index = 0;
        node.apply_children(self)?;
        (self.dir, self.index) = outer;

        Ok(())
    }
}

/// Load the buffer of every node that has an extract path from `source`.
pub struct AttachBuffers<F> {
    source: F,
}

impl<F: FnMut(&str) -> io::Result<Vec<u8>>> AttachBuffers<F> {
    pub fn new(source: F) -> Self {
        Self { source }
    }
}

impl<F: FnMut(&str) -> io::Result<Vec<u8>>> Visitor for AttachBuffers<F> {
    fn visit(&mut self, mut node: Node<'_>) -> Result<()> {
        if !node.extract_path().is_empty() {
            let buf = (self.source)(node.extract_path())?;
            node.set_buf(buf);
        }

        node.apply_children(self)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        format::{
            Firmware,
            file::{File, FileType},
            section::Section,
        },
        guid::Guid,
    };

    #[test]
    fn extract_then_attach() {
        let sections = vec![Section::new_ui("Shell").unwrap()];
        let file = File::new(Guid([1; 16]), FileType::APPLICATION, sections, 0xff).unwrap();
        let original = file.buf.clone();

        let mut store = HashMap::new();
        let mut fw = Firmware::File(file);
        fw.apply(&mut ExtractBuffers::new(|key: &str, data: &[u8]| {
            store.insert(key.to_owned(), data.to_vec());
            Ok(())
        }))
        .unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.contains_key("File/body.bin"));
        assert!(store.contains_key("File/0_Section/body.bin"));

        let json = serde_json::to_string(&fw).unwrap();
        let mut restored: Firmware = serde_json::from_str(&json).unwrap();
        assert!(restored.buf().is_empty());

        restored
            .apply(&mut AttachBuffers::new(|key: &str| {
                store
                    .get(key)
                    .cloned()
                    .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, key.to_owned()))
            }))
            .unwrap();
        assert_eq!(restored.buf(), original);
    }
}
