//! Recover C-style record layouts from a raw process memory dump.
//!
//! Given a dump and a heap walker's list of allocated chunks, the analysis
//! pipeline guesses a typed field layout for every allocation, resolves the
//! pointer relations between them, groups allocations by structural
//! similarity and emits a record-type catalog with per-field value
//! histograms. The output is a best-effort starting point for an analyst,
//! not ground truth.
//!
//! Entry points: build a [mem::MemorySource] (a [mem::DumpDir] for on-disk
//! dumps, a [mem::MemBuffer] for in-memory ones), load a
//! [context::ProcessContext] from it, then run
//! [analysis::reverse_instances]. Every artifact lands under the dump's
//! cache directory; see the `memrev` binary for the command-line wrapping.
use getset::CopyGetters;
use std::fmt;

pub mod analysis;
pub mod cache;
pub mod context;
pub mod counter;
pub mod error;
pub mod fields;
pub mod graphs;
pub mod mem;
pub mod record;
pub mod words;

pub use crate::error::{Error, Result};

/// Pointer width of the dumped process.
///
/// This controls how candidate pointers and integers are decoded, and can
/// generally be otherwise ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WordSize {
    U32,
    U64,
}

impl WordSize {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            WordSize::U32 => 4,
            WordSize::U64 => 8,
        }
    }
}

/// Byte order of the dumped process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Endianness {
    Little,
    Big,
}

/// Word size and endianness of the dump, as reported by the byte oracle.
#[derive(CopyGetters, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetPlatform {
    #[get_copy = "pub"]
    word_size: WordSize,
    #[get_copy = "pub"]
    endianness: Endianness,
}

impl TargetPlatform {
    pub fn new(word_size: WordSize, endianness: Endianness) -> TargetPlatform {
        TargetPlatform {
            word_size,
            endianness,
        }
    }

    pub fn word_bytes(&self) -> usize {
        self.word_size.size_in_bytes()
    }

    /// Decode one machine word from the front of `input`.
    ///
    /// Returns `None` when `input` is shorter than a word.
    pub fn read_word(&self, input: &[u8]) -> Option<u64> {
        use nom::number::complete as number;

        match (self.word_size, self.endianness) {
            (WordSize::U32, Endianness::Little) => {
                let res: nom::IResult<&[u8], u32> = number::le_u32(input);
                res.ok().map(|(_, v)| u64::from(v))
            }
            (WordSize::U32, Endianness::Big) => {
                let res: nom::IResult<&[u8], u32> = number::be_u32(input);
                res.ok().map(|(_, v)| u64::from(v))
            }
            (WordSize::U64, Endianness::Little) => {
                let res: nom::IResult<&[u8], u64> = number::le_u64(input);
                res.ok().map(|(_, v)| v)
            }
            (WordSize::U64, Endianness::Big) => {
                let res: nom::IResult<&[u8], u64> = number::be_u64(input);
                res.ok().map(|(_, v)| v)
            }
        }
    }

    /// Sign-extend a decoded word to an `i64`.
    pub fn sign_extend(&self, word: u64) -> i64 {
        match self.word_size {
            WordSize::U32 => i64::from(word as u32 as i32),
            WordSize::U64 => word as i64,
        }
    }
}

impl fmt::Display for TargetPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = match self.word_size {
            WordSize::U32 => 32,
            WordSize::U64 => 64,
        };
        let endian = match self.endianness {
            Endianness::Little => "le",
            Endianness::Big => "be",
        };
        write!(f, "{}-bit {}", bits, endian)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_word_respects_endianness() {
        let le = TargetPlatform::new(WordSize::U32, Endianness::Little);
        let be = TargetPlatform::new(WordSize::U32, Endianness::Big);
        let bytes = [0x01, 0x02, 0x03, 0x04];

        assert_eq!(Some(0x0403_0201), le.read_word(&bytes));
        assert_eq!(Some(0x0102_0304), be.read_word(&bytes));
    }

    #[test]
    fn read_word_needs_a_full_word() {
        let target = TargetPlatform::new(WordSize::U64, Endianness::Little);
        assert_eq!(None, target.read_word(&[0x01, 0x02, 0x03]));
    }

    #[test]
    fn sign_extension_is_word_sized() {
        let target = TargetPlatform::new(WordSize::U32, Endianness::Little);
        assert_eq!(-1, target.sign_extend(0xffff_ffff));
        let target = TargetPlatform::new(WordSize::U64, Endianness::Little);
        assert_eq!(-1, target.sign_extend(0xffff_ffff_ffff_ffff));
    }
}
