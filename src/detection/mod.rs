//! Signature detection.
//!
//! - `signature`: signature records and the per-run library
//! - `matcher`: the two-phase matching engine
//! - `unpack`: unpacker collaborators and scratch directory cleanup
//! - `decode`: lossless text decoding of unpacked content

pub mod decode;
pub mod matcher;
pub mod signature;
pub mod unpack;

pub use matcher::{MatchOutcome, SignatureMatcher};
pub use signature::{Signature, SignatureLibrary};
pub use unpack::{build_unpacker, ApktoolUnpacker, ScratchDir, Unpacker, ZipUnpacker};
