// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use flashtree::format::nvram::NVarStore;
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                for polarity in [0x00, 0xff] {
                    if let Ok(mut store) = NVarStore::parse(data, polarity) {
                        let _ = store.compact();
                    }
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
