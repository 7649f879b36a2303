// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

#[cfg(not(windows))]
mod fuzz {
    use flashtree::{
        format::{self, Context},
        visitors::Assemble,
    };
    use honggfuzz::fuzz;

    pub fn main() {
        loop {
            fuzz!(|data: &[u8]| {
                let mut ctx = Context::default();
                ctx.allow_polarity_mismatch = true;
                if let Ok(mut fw) = format::parse(data, &mut ctx) {
                    let _ = fw.apply(&mut Assemble::new());
                }
            });
        }
    }
}

fn main() {
    #[cfg(not(windows))]
    fuzz::main();
}
