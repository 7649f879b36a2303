// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use flashtree::format::{Context, section};
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let _ = section::parse_sections(data, &mut Context::default());
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
