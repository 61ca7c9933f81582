//! General-purpose byte compressors used for the three streams of every node
//!
//! The block format only depends on the [`Compressor`] contract. A backend is
//! chosen by the small integer id stored in the file flags, resolved through
//! [`CompressorKind`].

use std::{io, str::FromStr};

use zstd::zstd_safe;

use crate::{error::FormatError, Result};

/// Compress/decompress contract for one stream at a time
///
/// Implementations own their contexts and scratch state, so one instance is
/// created per worker and never shared.
pub trait Compressor: Send {
    /// Compresses `src`, replacing the contents of `dst`
    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<()>;

    /// Decompresses `src`, replacing the contents of `dst`
    ///
    /// `size_hint` is an upper bound on the decompressed size. Streams that
    /// declare a larger size are rejected before any allocation; it is also the
    /// capacity used when the backend cannot recover the size from its framing.
    fn decompress(&mut self, src: &[u8], dst: &mut Vec<u8>, size_hint: usize) -> Result<()>;

    fn kind(&self) -> CompressorKind;
}

/// Backends known to the file format, indexed by their stored id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CompressorKind {
    /// ZSTD frames
    #[default]
    Zstd = 0,
    /// Uncompressed copies
    Store = 1,
}
impl CompressorKind {
    #[must_use]
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            0 => Ok(Self::Zstd),
            1 => Ok(Self::Store),
            _ => Err(FormatError::UnknownCompressor(id).into()),
        }
    }

    /// Creates a fresh compressor of this kind
    #[must_use]
    pub fn build(self, level: u8) -> Box<dyn Compressor> {
        match self {
            Self::Zstd => Box::new(ZstdCompressor::new(level)),
            Self::Store => Box::new(StoreCompressor),
        }
    }
}
impl FromStr for CompressorKind {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "zstd" => Ok(Self::Zstd),
            "store" | "none" => Ok(Self::Store),
            _ => Err(format!("Unknown compressor: {s}")),
        }
    }
}

/// ZSTD backend with reusable compression and decompression contexts
pub struct ZstdCompressor {
    level: i32,
    cctx: zstd_safe::CCtx<'static>,
    dctx: zstd_safe::DCtx<'static>,
}
impl ZstdCompressor {
    #[must_use]
    pub fn new(level: u8) -> Self {
        Self {
            level: i32::from(level),
            cctx: zstd_safe::CCtx::create(),
            dctx: zstd_safe::DCtx::create(),
        }
    }
}
impl Compressor for ZstdCompressor {
    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        // the context writes from the start of the buffer and sets its length
        dst.clear();
        dst.reserve(zstd_safe::compress_bound(src.len()));
        self.cctx
            .compress(dst, src, self.level)
            .map_err(|e| io::Error::other(zstd_safe::get_error_name(e)))?;
        Ok(())
    }

    fn decompress(&mut self, src: &[u8], dst: &mut Vec<u8>, size_hint: usize) -> Result<()> {
        let capacity = match zstd_safe::get_frame_content_size(src) {
            Ok(Some(size)) if size <= size_hint as u64 => size as usize,
            Ok(Some(size)) => {
                return Err(FormatError::Compressor(format!(
                    "Frame declares {size} bytes, beyond the bound of {size_hint}"
                ))
                .into())
            }
            Ok(None) => size_hint,
            Err(_) => {
                return Err(FormatError::Compressor("Invalid ZSTD frame header".to_string()).into())
            }
        };
        dst.clear();
        dst.reserve(capacity);
        self.dctx
            .decompress(dst, src)
            .map_err(|e| FormatError::Compressor(zstd_safe::get_error_name(e).to_string()))?;
        Ok(())
    }

    fn kind(&self) -> CompressorKind {
        CompressorKind::Zstd
    }
}

/// Identity backend
#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCompressor;
impl Compressor for StoreCompressor {
    fn compress(&mut self, src: &[u8], dst: &mut Vec<u8>) -> Result<()> {
        dst.clear();
        dst.extend_from_slice(src);
        Ok(())
    }

    fn decompress(&mut self, src: &[u8], dst: &mut Vec<u8>, size_hint: usize) -> Result<()> {
        if src.len() > size_hint {
            return Err(FormatError::Compressor(format!(
                "Stored stream of {} bytes exceeds the bound of {size_hint}",
                src.len()
            ))
            .into());
        }
        dst.clear();
        dst.extend_from_slice(src);
        Ok(())
    }

    fn kind(&self) -> CompressorKind {
        CompressorKind::Store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data() -> Vec<u8> {
        (0..10_000u32).map(|i| (i % 7) as u8).collect()
    }

    #[test]
    fn test_kind_ids() {
        assert_eq!(CompressorKind::from_id(0).unwrap(), CompressorKind::Zstd);
        assert_eq!(CompressorKind::from_id(1).unwrap(), CompressorKind::Store);
        assert!(CompressorKind::from_id(7).is_err());
        assert_eq!(CompressorKind::Store.id(), 1);
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("ZSTD".parse::<CompressorKind>().unwrap(), CompressorKind::Zstd);
        assert_eq!("none".parse::<CompressorKind>().unwrap(), CompressorKind::Store);
        assert!("brotli".parse::<CompressorKind>().is_err());
    }

    #[test]
    fn test_zstd_shrinks_and_restores() {
        let data = sample_data();
        let mut compressor = CompressorKind::Zstd.build(3);
        let mut z = Vec::new();
        compressor.compress(&data, &mut z).unwrap();
        assert!(z.len() < data.len());

        let mut restored = vec![1, 2, 3];
        compressor.decompress(&z, &mut restored, data.len()).unwrap();
        assert_eq!(restored, data);
    }

    #[test]
    fn test_decompress_respects_bound() {
        let data = sample_data();
        for kind in [CompressorKind::Zstd, CompressorKind::Store] {
            let mut compressor = kind.build(3);
            let mut z = Vec::new();
            compressor.compress(&data, &mut z).unwrap();
            let mut out = Vec::new();
            assert!(matches!(
                compressor.decompress(&z, &mut out, data.len() - 1),
                Err(crate::Error::FormatError(FormatError::Compressor(_)))
            ));
            assert!(out.is_empty());
            compressor.decompress(&z, &mut out, data.len()).unwrap();
            assert_eq!(out, data);
        }
    }

    #[test]
    fn test_zstd_empty_input() {
        let mut compressor = ZstdCompressor::new(3);
        let mut z = Vec::new();
        compressor.compress(&[], &mut z).unwrap();
        let mut restored = Vec::new();
        compressor.decompress(&z, &mut restored, 16).unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn test_zstd_rejects_garbage() {
        let mut compressor = ZstdCompressor::new(3);
        let mut out = Vec::new();
        assert!(compressor.decompress(b"not a frame", &mut out, 64).is_err());
    }

    #[test]
    fn test_store_is_identity() {
        let data = sample_data();
        let mut compressor = CompressorKind::Store.build(0);
        let mut z = Vec::new();
        compressor.compress(&data, &mut z).unwrap();
        assert_eq!(z, data);
        assert_eq!(compressor.kind(), CompressorKind::Store);
    }
}
