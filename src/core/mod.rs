pub mod dedup;
pub mod hash;

#[cfg(test)]
pub(crate) mod fixtures;

pub use dedup::{
    DuplicateCandidate, ImageDeduplicator, Originality, RejectReason, UploadError, UploadReceipt,
};
pub use hash::{Digest, DigestError, DigestSet, HashAlgorithm, HashSettings, ImageHasher};
