use alloc::vec::Vec;

use crate::prelude::*;

/// The page compressors the swap-out path can run. Selection is live
/// configuration; the algorithm used for a slot is remembered per slot so
/// later swap-ins decode correctly even after a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    None,
    Lz4,
    Zlib,
    Zstd,
}

impl CompressionAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::Zstd => "zstd",
        }
    }

    /// The next-stronger algorithm, for pressure-driven escalation.
    pub fn escalate(self) -> Self {
        match self {
            CompressionAlgorithm::None => CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Lz4 => CompressionAlgorithm::Zlib,
            CompressionAlgorithm::Zlib => CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Zstd => CompressionAlgorithm::Zstd,
        }
    }
}

pub fn compress(algo: CompressionAlgorithm, data: &[u8]) -> Vec<u8> {
    match algo {
        CompressionAlgorithm::None => data.to_vec(),
        CompressionAlgorithm::Lz4 => lz4_flex::block::compress(data),
        CompressionAlgorithm::Zlib => miniz_oxide::deflate::compress_to_vec_zlib(data, 6),
        CompressionAlgorithm::Zstd => ruzstd::encoding::compress_to_vec(
            data,
            ruzstd::encoding::CompressionLevel::Fastest,
        ),
    }
}

/// Decompress into `out`, which must be filled exactly.
pub fn decompress(algo: CompressionAlgorithm, data: &[u8], out: &mut [u8]) -> KResult<()> {
    match algo {
        CompressionAlgorithm::None => {
            if data.len() != out.len() {
                return Err(KernelError::Io);
            }
            out.copy_from_slice(data);
            Ok(())
        }
        CompressionAlgorithm::Lz4 => {
            let decoded =
                lz4_flex::block::decompress(data, out.len()).map_err(|_| KernelError::Io)?;
            if decoded.len() != out.len() {
                return Err(KernelError::Io);
            }
            out.copy_from_slice(&decoded);
            Ok(())
        }
        CompressionAlgorithm::Zlib => {
            let decoded = miniz_oxide::inflate::decompress_to_vec_zlib(data)
                .map_err(|_| KernelError::Io)?;
            if decoded.len() != out.len() {
                return Err(KernelError::Io);
            }
            out.copy_from_slice(&decoded);
            Ok(())
        }
        CompressionAlgorithm::Zstd => {
            use ruzstd::io::Read as _;

            let mut decoder =
                ruzstd::decoding::StreamingDecoder::new(data).map_err(|_| KernelError::Io)?;

            let mut filled = 0;
            while filled < out.len() {
                match decoder.read(&mut out[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(_) => return Err(KernelError::Io),
                }
            }

            if filled != out.len() {
                return Err(KernelError::Io);
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zenith_mm::paging::PAGE_SIZE;

    fn page_pattern() -> Vec<u8> {
        (0..PAGE_SIZE).map(|i| ((i * 31) % 251) as u8).collect()
    }

    #[test]
    fn every_compressor_round_trips() {
        let data = page_pattern();

        for algo in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zlib,
            CompressionAlgorithm::Zstd,
        ] {
            let compressed = compress(algo, &data);
            let mut back = alloc::vec![0u8; PAGE_SIZE];
            decompress(algo, &compressed, &mut back).unwrap();
            assert_eq!(back, data, "{} failed to round-trip", algo.name());
        }
    }

    #[test]
    fn compressible_data_actually_shrinks() {
        let data = alloc::vec![7u8; PAGE_SIZE];

        for algo in [
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zlib,
            CompressionAlgorithm::Zstd,
        ] {
            assert!(
                compress(algo, &data).len() < PAGE_SIZE,
                "{} did not shrink a constant page",
                algo.name()
            );
        }
    }

    #[test]
    fn escalation_is_monotonic_and_capped() {
        let mut algo = CompressionAlgorithm::None;
        algo = algo.escalate();
        assert_eq!(algo, CompressionAlgorithm::Lz4);
        algo = algo.escalate();
        assert_eq!(algo, CompressionAlgorithm::Zlib);
        algo = algo.escalate();
        assert_eq!(algo, CompressionAlgorithm::Zstd);
        assert_eq!(algo.escalate(), CompressionAlgorithm::Zstd);
    }
}
