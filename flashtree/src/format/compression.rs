// SPDX-FileCopyrightText: 2025 The flashtree Authors
// SPDX-License-Identifier: GPL-3.0-only

//! Codecs used by GUID-defined sections. Every codec is a pure
//! `bytes -> bytes` transform and `decode(encode(x)) == x` must hold.

use std::{
    io::{self, Read, Write},
    path::PathBuf,
    process::{Command, ExitStatus, Stdio},
    thread,
};

use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use liblzma::{
    read::XzDecoder,
    stream::{LzmaOptions, Stream},
    write::XzEncoder,
};
use lz4_flex::frame::{FrameDecoder, FrameEncoder};
use thiserror::Error;

use crate::guid::{self, Guid};

/// Size of the .lzma header: properties byte, dictionary size and
/// uncompressed size.
const LZMA_HEADER_SIZE: usize = 13;
/// Offset of the 8-byte uncompressed size inside the .lzma header.
const LZMA_SIZE_OFFSET: usize = 5;
/// Dictionary size used when encoding. UEFI decoders decompress straight into
/// the output buffer, so this only affects the encoder's memory usage.
const LZMA_DICT_SIZE: u32 = 1 << 23;

/// Size of the fixed header in front of ZLIB payloads.
const ZLIB_HEADER_SIZE: usize = 256;
/// Offset of the little-endian compressed length within the ZLIB header.
const ZLIB_SIZE_OFFSET: usize = 20;

/// Size of the header in front of BROTLI payloads: uncompressed size followed
/// by the decoder scratch buffer size.
const BROTLI_HEADER_SIZE: usize = 16;
const BROTLI_SCRATCH_SIZE: u64 = 0x0003_0000;

/// Upper bound for decompressed output. Flash parts top out well below this.
pub const MAX_DECODED_SIZE: u64 = 256 << 20;
/// Memory limit for the LZMA decoder, which mostly goes to the dictionary.
const LZMA_MEMLIMIT: u64 = 512 << 20;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to initialize LZMA stream")]
    LzmaInit(#[from] liblzma::stream::Error),
    #[error("{codec}: I/O error while {op}")]
    Io {
        codec: &'static str,
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{codec}: Input too short for header: {len} bytes")]
    TooShort { codec: &'static str, len: usize },
    #[error("{codec}: Header declares {declared} bytes, but have {actual}")]
    SizeMismatch {
        codec: &'static str,
        declared: u64,
        actual: u64,
    },
    #[error("{codec}: Output exceeds {limit} bytes")]
    SizeTooLarge { codec: &'static str, limit: u64 },
    #[error("LZ4 frame error")]
    Lz4(#[from] lz4_flex::frame::Error),
    #[error("Failed to run {program:?}")]
    BrotliSpawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{program:?} exited with {status}: {stderr}")]
    BrotliFailed {
        program: PathBuf,
        status: ExitStatus,
        stderr: String,
    },
}

type Result<T> = std::result::Result<T, Error>;

fn io_err(codec: &'static str, op: &'static str) -> impl FnOnce(io::Error) -> Error {
    move |source| Error::Io { codec, op, source }
}

/// Read all decompressed output, failing once it grows past `limit` bytes.
fn read_limited(codec: &'static str, reader: impl Read, limit: u64) -> Result<Vec<u8>> {
    let mut out = vec![];
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(io_err(codec, "decompressing"))?;

    if out.len() as u64 > limit {
        return Err(Error::SizeTooLarge { codec, limit });
    }

    Ok(out)
}

/// A named, reversible byte transform.
pub trait Codec: Send + Sync {
    fn name(&self) -> &'static str;

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Raw LZMA1 in the .lzma container. The header always carries the real
/// uncompressed size because UEFI decoders reject the unknown-size marker.
#[derive(Clone, Copy, Debug, Default)]
pub struct Lzma;

impl Lzma {
    fn compress(data: &[u8]) -> Result<Vec<u8>> {
        let mut options = LzmaOptions::new_preset(9)?;
        options.dict_size(LZMA_DICT_SIZE);

        let stream = Stream::new_lzma_encoder(&options)?;
        let mut encoder = XzEncoder::new_stream(Vec::new(), stream);
        encoder
            .write_all(data)
            .map_err(io_err("LZMA", "compressing"))?;
        let mut out = encoder.finish().map_err(io_err("LZMA", "compressing"))?;

        if out.len() < LZMA_HEADER_SIZE {
            return Err(Error::TooShort {
                codec: "LZMA",
                len: out.len(),
            });
        }

        out[LZMA_SIZE_OFFSET..LZMA_HEADER_SIZE].copy_from_slice(&(data.len() as u64).to_le_bytes());

        Ok(out)
    }

    fn decompress(data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < LZMA_HEADER_SIZE {
            return Err(Error::TooShort {
                codec: "LZMA",
                len: data.len(),
            });
        }

        let mut size = [0u8; 8];
        size.copy_from_slice(&data[LZMA_SIZE_OFFSET..LZMA_HEADER_SIZE]);
        let declared = u64::from_le_bytes(size);

        let limit = if declared == u64::MAX {
            MAX_DECODED_SIZE
        } else if declared > MAX_DECODED_SIZE {
            return Err(Error::SizeTooLarge {
                codec: "LZMA",
                limit: MAX_DECODED_SIZE,
            });
        } else {
            declared
        };

        let stream = Stream::new_lzma_decoder(LZMA_MEMLIMIT)?;
        let out = read_limited("LZMA", XzDecoder::new_stream(data, stream), limit)?;

        if declared != u64::MAX && declared != out.len() as u64 {
            return Err(Error::SizeMismatch {
                codec: "LZMA",
                declared,
                actual: out.len() as u64,
            });
        }

        Ok(out)
    }
}

impl Codec for Lzma {
    fn name(&self) -> &'static str {
        "LZMA"
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Self::decompress(data)
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        Self::compress(data)
    }
}

/// LZMA with the x86 branch/call/jump filter applied to the plaintext.
#[derive(Clone, Copy, Debug, Default)]
pub struct LzmaX86;

impl Codec for LzmaX86 {
    fn name(&self) -> &'static str {
        "LZMAX86"
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Lzma::decompress(data)?;
        x86_convert(&mut out, false);
        Ok(out)
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut filtered = data.to_vec();
        x86_convert(&mut filtered, true);
        Lzma::compress(&filtered)
    }
}

/// Convert relative x86 CALL/JMP targets to absolute ones (`encoding`) or
/// back. The whole buffer is processed in one pass starting at address 0.
fn x86_convert(data: &mut [u8], encoding: bool) {
    const MASK_TO_ALLOWED: [bool; 8] = [true, true, true, false, true, false, false, false];
    const MASK_TO_BIT_NUMBER: [u32; 8] = [0, 1, 2, 2, 3, 3, 3, 3];

    fn is_ms_byte(b: u8) -> bool {
        b == 0 || b == 0xff
    }

    if data.len() < 5 {
        return;
    }

    let ip = 5u32;
    let limit = data.len() - 4;
    let mut prev_mask = 0u32;
    let mut prev_pos = usize::MAX;
    let mut pos = 0;

    loop {
        while pos < limit && data[pos] & 0xfe != 0xe8 {
            pos += 1;
        }
        if pos >= limit {
            break;
        }

        let distance = pos.wrapping_sub(prev_pos);
        if distance > 3 {
            prev_mask = 0;
        } else {
            prev_mask = (prev_mask << (distance - 1)) & 0x7;
            if prev_mask != 0 {
                let b = data[pos + 4 - MASK_TO_BIT_NUMBER[prev_mask as usize] as usize];
                if !MASK_TO_ALLOWED[prev_mask as usize] || is_ms_byte(b) {
                    prev_pos = pos;
                    prev_mask = ((prev_mask << 1) & 0x7) | 1;
                    pos += 1;
                    continue;
                }
            }
        }
        prev_pos = pos;

        if is_ms_byte(data[pos + 4]) {
            let mut src =
                u32::from_le_bytes([data[pos + 1], data[pos + 2], data[pos + 3], data[pos + 4]]);
            let mut dest;

            loop {
                let current = ip.wrapping_add(pos as u32);
                dest = if encoding {
                    current.wrapping_add(src)
                } else {
                    src.wrapping_sub(current)
                };

                if prev_mask == 0 {
                    break;
                }

                let index = MASK_TO_BIT_NUMBER[prev_mask as usize] * 8;
                if !is_ms_byte((dest >> (24 - index)) as u8) {
                    break;
                }

                src = dest ^ ((1u32 << (32 - index)) - 1);
            }

            data[pos + 4] = !((dest >> 24) & 1).wrapping_sub(1) as u8;
            data[pos + 1..pos + 4].copy_from_slice(&dest.to_le_bytes()[..3]);
            pos += 5;
        } else {
            prev_mask = ((prev_mask << 1) & 0x7) | 1;
            pos += 1;
        }
    }
}

/// ZLIB stream behind a fixed 256-byte header holding the compressed length.
#[derive(Clone, Copy, Debug, Default)]
pub struct Zlib;

impl Codec for Zlib {
    fn name(&self) -> &'static str {
        "ZLIB"
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < ZLIB_HEADER_SIZE {
            return Err(Error::TooShort {
                codec: "ZLIB",
                len: data.len(),
            });
        }

        let mut size = [0u8; 4];
        size.copy_from_slice(&data[ZLIB_SIZE_OFFSET..ZLIB_SIZE_OFFSET + 4]);
        let declared = u64::from(u32::from_le_bytes(size));
        let actual = (data.len() - ZLIB_HEADER_SIZE) as u64;

        if declared != actual {
            return Err(Error::SizeMismatch {
                codec: "ZLIB",
                declared,
                actual,
            });
        }

        read_limited(
            "ZLIB",
            ZlibDecoder::new(&data[ZLIB_HEADER_SIZE..]),
            MAX_DECODED_SIZE,
        )
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder
            .write_all(data)
            .map_err(io_err("ZLIB", "compressing"))?;
        let compressed = encoder.finish().map_err(io_err("ZLIB", "compressing"))?;

        let size: u32 = compressed
            .len()
            .try_into()
            .map_err(|_| Error::SizeMismatch {
                codec: "ZLIB",
                declared: u64::from(u32::MAX),
                actual: compressed.len() as u64,
            })?;

        let mut out = vec![0u8; ZLIB_HEADER_SIZE];
        out[ZLIB_SIZE_OFFSET..ZLIB_SIZE_OFFSET + 4].copy_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&compressed);

        Ok(out)
    }
}

/// Standard LZ4 frame format.
#[derive(Clone, Copy, Debug, Default)]
pub struct Lz4;

impl Codec for Lz4 {
    fn name(&self) -> &'static str {
        "LZ4"
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        read_limited("LZ4", FrameDecoder::new(data), MAX_DECODED_SIZE)
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = FrameEncoder::new(Vec::new());
        encoder
            .write_all(data)
            .map_err(io_err("LZ4", "compressing"))?;

        Ok(encoder.finish()?)
    }
}

/// BROTLI through an external `brotli` executable.
#[derive(Clone, Debug)]
pub struct Brotli {
    program: PathBuf,
}

impl Default for Brotli {
    fn default() -> Self {
        Self::new("brotli")
    }
}

impl Brotli {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[&str], input: &[u8]) -> Result<Vec<u8>> {
        let spawn_err = |source| Error::BrotliSpawn {
            program: self.program.clone(),
            source,
        };

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(spawn_err)?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_err(io::Error::other("stdin not captured")))?;

        // Feed stdin from a separate thread so large outputs cannot deadlock.
        let (write_result, output) = thread::scope(|s| {
            let writer = s.spawn(move || stdin.write_all(input));
            let output = child.wait_with_output();
            let write_result = writer
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")));

            (write_result, output)
        });

        let output = output.map_err(spawn_err)?;

        if !output.status.success() {
            return Err(Error::BrotliFailed {
                program: self.program.clone(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        write_result.map_err(spawn_err)?;

        Ok(output.stdout)
    }
}

impl Codec for Brotli {
    fn name(&self) -> &'static str {
        "BROTLI"
    }

    fn decode(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < BROTLI_HEADER_SIZE {
            return Err(Error::TooShort {
                codec: "BROTLI",
                len: data.len(),
            });
        }

        let mut size = [0u8; 8];
        size.copy_from_slice(&data[..8]);
        let declared = u64::from_le_bytes(size);
        if declared > MAX_DECODED_SIZE {
            return Err(Error::SizeTooLarge {
                codec: "BROTLI",
                limit: MAX_DECODED_SIZE,
            });
        }

        let out = self.run(&["--decompress", "--stdout"], &data[BROTLI_HEADER_SIZE..])?;

        if declared != out.len() as u64 {
            return Err(Error::SizeMismatch {
                codec: "BROTLI",
                declared,
                actual: out.len() as u64,
            });
        }

        Ok(out)
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let compressed = self.run(&["--stdout", "--quality=9"], data)?;

        let mut out = Vec::with_capacity(BROTLI_HEADER_SIZE + compressed.len());
        out.extend_from_slice(&(data.len() as u64).to_le_bytes());
        out.extend_from_slice(&BROTLI_SCRATCH_SIZE.to_le_bytes());
        out.extend_from_slice(&compressed);

        Ok(out)
    }
}

static LZMA: Lzma = Lzma;
static LZMA_X86: LzmaX86 = LzmaX86;

/// Look up the codec for a GUID-defined section. Unknown GUIDs return `None`,
/// which means the section payload is treated as opaque.
pub fn codec_for_guid(guid: &Guid) -> Option<&'static dyn Codec> {
    if *guid == guid::LZMA {
        Some(&LZMA)
    } else if *guid == guid::LZMA_X86 {
        Some(&LZMA_X86)
    } else {
        None
    }
}

/// Look up a codec by its [`Codec::name`].
pub fn codec_by_name(name: &str) -> Option<Box<dyn Codec>> {
    match name {
        "LZMA" => Some(Box::new(Lzma)),
        "LZMAX86" => Some(Box::new(LzmaX86)),
        "ZLIB" => Some(Box::new(Zlib)),
        "LZ4" => Some(Box::new(Lz4)),
        "BROTLI" => Some(Box::new(Brotli::default())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x86_filter_round_trip() {
        let mut data = vec![];
        for i in 0..512u32 {
            data.extend_from_slice(&[0x90, 0xe8]);
            data.extend_from_slice(&i.wrapping_mul(0x1234_5678).to_le_bytes());
            data.extend_from_slice(&[0xe9, 0x10, 0x00, 0x00, 0x00, 0xe8, 0xe8, 0xff]);
        }
        let original = data.clone();

        x86_convert(&mut data, true);
        assert_ne!(data, original);

        x86_convert(&mut data, false);
        assert_eq!(data, original);
    }

    #[test]
    fn x86_filter_short_input() {
        let mut data = vec![0xe8, 0x00, 0x00, 0x00];
        x86_convert(&mut data, true);
        assert_eq!(data, [0xe8, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn zlib_rejects_bad_size() {
        let mut encoded = Zlib.encode(b"payload").unwrap();
        encoded[ZLIB_SIZE_OFFSET] ^= 0x01;
        assert!(matches!(
            Zlib.decode(&encoded),
            Err(Error::SizeMismatch { codec: "ZLIB", .. })
        ));
    }

    #[test]
    fn output_limit() {
        assert_eq!(read_limited("RAW", &b"abcd"[..], 4).unwrap(), b"abcd");
        assert!(matches!(
            read_limited("RAW", &b"abcde"[..], 4),
            Err(Error::SizeTooLarge { codec: "RAW", limit: 4 })
        ));
    }

    #[test]
    fn lzma_rejects_huge_declared_size() {
        let mut encoded = Lzma.encode(b"payload").unwrap();
        encoded[LZMA_SIZE_OFFSET..LZMA_HEADER_SIZE]
            .copy_from_slice(&(MAX_DECODED_SIZE + 1).to_le_bytes());
        assert!(matches!(
            Lzma.decode(&encoded),
            Err(Error::SizeTooLarge { codec: "LZMA", .. })
        ));
    }

    #[test]
    fn registry() {
        assert_eq!(codec_for_guid(&guid::LZMA).map(|c| c.name()), Some("LZMA"));
        assert_eq!(
            codec_for_guid(&guid::LZMA_X86).map(|c| c.name()),
            Some("LZMAX86")
        );
        assert!(codec_for_guid(&guid::FFS2).is_none());
        assert_eq!(codec_by_name("LZ4").map(|c| c.name()), Some("LZ4"));
    }
}
