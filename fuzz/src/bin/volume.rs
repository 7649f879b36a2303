// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use flashtree::format::{Context, volume::FirmwareVolume};
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                if let Ok(mut fv) = FirmwareVolume::parse(data, &mut Context::default()) {
                    let _ = fv.assemble(false);
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
