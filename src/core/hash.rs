use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use image_hasher::{HashAlg, HasherConfig};
use log::warn;
use rustdct::{Dct2, DctPlanner};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DigestError {
    #[error("Failed to open image {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to decode image {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: image::ImageError,
    },

    #[error("Invalid digest `{0}`: expected a hex string")]
    InvalidDigest(String),

    #[error("Digest widths differ: {left} bits vs {right} bits")]
    LengthMismatch { left: usize, right: usize },

    #[error("Invalid hash algorithm `{0}`: expected phash, ahash or dhash")]
    InvalidAlgorithm(String),

    #[error("Invalid hash settings: {0}")]
    InvalidSettings(String),
}

/// Perceptual hash variants. Digests of different variants are not comparable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    PHash,
    AHash,
    DHash,
}

impl HashAlgorithm {
    /// Every variant, in the order duplicate scans compare them.
    pub const ALL: [HashAlgorithm; 3] = [Self::PHash, Self::AHash, Self::DHash];

    /// Name of the variant, which is also its column in the `images` table.
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::PHash => "phash",
            HashAlgorithm::AHash => "ahash",
            HashAlgorithm::DHash => "dhash",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "phash" => Ok(HashAlgorithm::PHash),
            "ahash" => Ok(HashAlgorithm::AHash),
            "dhash" => Ok(HashAlgorithm::DHash),
            _ => Err(DigestError::InvalidAlgorithm(s.to_string())),
        }
    }
}

/// Hex-encoded perceptual digest.
///
/// The `hash_size²` bits are packed into whole bytes, so the canonical width
/// is four bits per hex character: 64 for `hash_size = 8`, but 16 for
/// `hash_size = 3`, whose nine bits occupy two bytes. The padding bits are
/// always zero. Digests of different widths are never padded or truncated to
/// make them comparable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Parse a digest, rejecting empty or non-hex input.
    pub fn from_hex(hex: impl Into<String>) -> Result<Self, DigestError> {
        let hex = hex.into();
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DigestError::InvalidDigest(hex));
        }
        Ok(Digest(hex.to_ascii_lowercase()))
    }

    /// Wrap a value read back from the fingerprint store. Validation is
    /// deferred to [`Digest::distance`].
    pub(crate) fn from_stored(hex: String) -> Self {
        Digest(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn bit_width(&self) -> usize {
        self.0.len() * 4
    }

    /// Hamming distance: the number of differing bits.
    pub fn distance(&self, other: &Digest) -> Result<u32, DigestError> {
        hamming_distance(&self.0, &other.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Count the differing bits of two hex digests of equal width.
pub fn hamming_distance(left: &str, right: &str) -> Result<u32, DigestError> {
    if left.len() != right.len() {
        return Err(DigestError::LengthMismatch {
            left: left.len() * 4,
            right: right.len() * 4,
        });
    }

    left.chars()
        .zip(right.chars())
        .try_fold(0u32, |acc, (a, b)| {
            let a = a
                .to_digit(16)
                .ok_or_else(|| DigestError::InvalidDigest(left.to_string()))?;
            let b = b
                .to_digit(16)
                .ok_or_else(|| DigestError::InvalidDigest(right.to_string()))?;
            Ok(acc + (a ^ b).count_ones())
        })
}

/// Up to one digest per variant, as stored for each image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestSet {
    pub phash: Option<Digest>,
    pub ahash: Option<Digest>,
    pub dhash: Option<Digest>,
}

impl DigestSet {
    pub fn get(&self, algorithm: HashAlgorithm) -> Option<&Digest> {
        match algorithm {
            HashAlgorithm::PHash => self.phash.as_ref(),
            HashAlgorithm::AHash => self.ahash.as_ref(),
            HashAlgorithm::DHash => self.dhash.as_ref(),
        }
    }

    pub fn set(&mut self, algorithm: HashAlgorithm, digest: Option<Digest>) {
        match algorithm {
            HashAlgorithm::PHash => self.phash = digest,
            HashAlgorithm::AHash => self.ahash = digest,
            HashAlgorithm::DHash => self.dhash = digest,
        }
    }

    /// Present digests in phash, ahash, dhash order.
    pub fn iter(&self) -> impl Iterator<Item = (HashAlgorithm, &Digest)> {
        HashAlgorithm::ALL
            .into_iter()
            .filter_map(|algorithm| self.get(algorithm).map(|digest| (algorithm, digest)))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// Digest parameters. `highfreq_factor` only applies to phash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashSettings {
    pub algorithm: HashAlgorithm,
    pub hash_size: u32,
    pub highfreq_factor: u32,
}

impl Default for HashSettings {
    fn default() -> Self {
        Self {
            algorithm: HashAlgorithm::PHash,
            hash_size: 8,
            highfreq_factor: 4,
        }
    }
}

impl HashSettings {
    pub fn validate(&self) -> Result<(), DigestError> {
        if self.hash_size < 2 {
            return Err(DigestError::InvalidSettings(format!(
                "hash_size must be at least 2, got {}",
                self.hash_size
            )));
        }
        if self.highfreq_factor < 1 {
            return Err(DigestError::InvalidSettings(
                "highfreq_factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Computes perceptual digests for image files.
#[derive(Debug, Clone)]
pub struct ImageHasher {
    settings: HashSettings,
}

impl ImageHasher {
    pub fn new(settings: HashSettings) -> Result<Self, DigestError> {
        settings.validate()?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &HashSettings {
        &self.settings
    }

    /// The primary variant, used for originality checks.
    pub fn algorithm(&self) -> HashAlgorithm {
        self.settings.algorithm
    }

    /// Compute the primary digest of the image at `path`.
    ///
    /// An unreadable or undecodable image yields an error rather than a
    /// digest; callers must treat that as "cannot evaluate", never as unique.
    pub fn compute(&self, path: &Path) -> Result<Digest, DigestError> {
        let image = load_image(path).inspect_err(|e| {
            warn!("Error computing hash for {}: {}", path.display(), e);
        })?;
        Ok(self.hash_with(self.settings.algorithm, &image))
    }

    /// Compute the primary digest of an already decoded image.
    pub fn compute_image(&self, image: &DynamicImage) -> Digest {
        self.hash_with(self.settings.algorithm, image)
    }

    /// Compute every variant with the configured `hash_size`. The image is
    /// decoded once; on failure the set comes back empty.
    pub fn compute_all(&self, path: &Path) -> DigestSet {
        let mut digests = DigestSet::default();
        match load_image(path) {
            Ok(image) => {
                for algorithm in HashAlgorithm::ALL {
                    digests.set(algorithm, Some(self.hash_with(algorithm, &image)));
                }
            }
            Err(e) => warn!("Error computing hashes for {}: {}", path.display(), e),
        }
        digests
    }

    fn hash_with(&self, algorithm: HashAlgorithm, image: &DynamicImage) -> Digest {
        let size = self.settings.hash_size;
        let config = HasherConfig::new().hash_size(size, size);

        let bytes = match algorithm {
            HashAlgorithm::PHash => self.dct_bits(image),
            HashAlgorithm::AHash => config
                .hash_alg(HashAlg::Mean)
                .to_hasher()
                .hash_image(image)
                .as_bytes()
                .to_vec(),
            HashAlgorithm::DHash => config
                .hash_alg(HashAlg::Gradient)
                .to_hasher()
                .hash_image(image)
                .as_bytes()
                .to_vec(),
        };

        Digest(hex::encode(bytes))
    }

    /// DCT hash: the grayscale image is resized to
    /// `hash_size * highfreq_factor` square and transformed in full. The top
    /// left `hash_size` square of coefficients is thresholded at its median.
    fn dct_bits(&self, image: &DynamicImage) -> Vec<u8> {
        let size = self.settings.hash_size as usize;
        let side = size * self.settings.highfreq_factor as usize;

        let gray = image
            .resize_exact(side as u32, side as u32, FilterType::Lanczos3)
            .into_luma8();
        let mut pixels: Vec<f32> = gray.pixels().map(|p| f32::from(p.0[0])).collect();

        let dct = DctPlanner::<f32>::new().plan_dct2(side);
        for row in pixels.chunks_exact_mut(side) {
            dct.process_dct2(row);
        }

        // Only the first `size` columns contribute to the low frequencies.
        let mut low = vec![0f32; size * size];
        let mut column = vec![0f32; side];
        for x in 0..size {
            for (y, value) in column.iter_mut().enumerate() {
                *value = pixels[y * side + x];
            }
            dct.process_dct2(&mut column);
            for k in 0..size {
                low[k * size + x] = column[k];
            }
        }

        let threshold = median(&low);
        pack_bits(low.iter().map(|&coefficient| coefficient > threshold))
    }
}

fn median(values: &[f32]) -> f32 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Pack bits most significant first, zero-padding the last byte.
fn pack_bits(bits: impl Iterator<Item = bool>) -> Vec<u8> {
    let mut bytes = Vec::new();
    for (i, bit) in bits.enumerate() {
        if i % 8 == 0 {
            bytes.push(0);
        }
        if bit {
            if let Some(last) = bytes.last_mut() {
                *last |= 0x80 >> (i % 8);
            }
        }
    }
    bytes
}

impl Default for ImageHasher {
    fn default() -> Self {
        Self {
            settings: HashSettings::default(),
        }
    }
}

fn load_image(path: &Path) -> Result<DynamicImage, DigestError> {
    let open_err = |source| DigestError::Open {
        path: path.display().to_string(),
        source,
    };

    ImageReader::open(path)
        .map_err(open_err)?
        .with_guessed_format()
        .map_err(open_err)?
        .decode()
        .map_err(|source| DigestError::Decode {
            path: path.display().to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixtures;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_compute_is_deterministic() {
        let temp_dir = TempDir::new().unwrap();
        let path = fixtures::write_blocks(temp_dir.path(), "a.png", 1);

        let hasher = ImageHasher::default();
        let first = hasher.compute(&path).unwrap();
        let second = hasher.compute(&path).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.bit_width(), 64);
        assert_eq!(first.distance(&second).unwrap(), 0);
    }

    #[test]
    fn test_hash_size_sets_width() {
        let temp_dir = TempDir::new().unwrap();
        let path = fixtures::write_blocks(temp_dir.path(), "a.png", 1);

        let hasher = ImageHasher::new(HashSettings {
            hash_size: 16,
            ..HashSettings::default()
        })
        .unwrap();

        let digests = hasher.compute_all(&path);
        for (_, digest) in digests.iter() {
            assert_eq!(digest.bit_width(), 256);
        }
    }

    #[test]
    fn test_width_rounds_up_to_whole_bytes() {
        let temp_dir = TempDir::new().unwrap();
        let path = fixtures::write_blocks(temp_dir.path(), "a.png", 1);

        let hasher = ImageHasher::new(HashSettings {
            hash_size: 3,
            ..HashSettings::default()
        })
        .unwrap();

        let digest = hasher.compute(&path).unwrap();
        assert_eq!(digest.bit_width(), 16);
        // Only the first nine bits carry information.
        let value = u16::from_str_radix(digest.as_str(), 16).unwrap();
        assert_eq!(value & 0x7f, 0);
    }

    #[test]
    fn test_phash_splits_at_median() {
        let temp_dir = TempDir::new().unwrap();
        let hasher = ImageHasher::default();

        for seed in 1..=5 {
            let path = fixtures::write_blocks(temp_dir.path(), &format!("{seed}.png"), seed);
            let digest = hasher.compute(&path).unwrap();
            let ones: u32 = hex::decode(digest.as_str())
                .unwrap()
                .iter()
                .map(|byte| byte.count_ones())
                .sum();
            assert!((28..=36).contains(&ones), "seed {seed}: {ones} bits set");
        }
    }

    #[test]
    fn test_highfreq_factor_changes_phash() {
        let temp_dir = TempDir::new().unwrap();
        let with_factor = |factor| {
            ImageHasher::new(HashSettings {
                highfreq_factor: factor,
                ..HashSettings::default()
            })
            .unwrap()
        };
        let (plain, oversampled) = (with_factor(1), with_factor(4));

        let differing = (1..=5)
            .filter(|&seed| {
                let path =
                    fixtures::write_blocks(temp_dir.path(), &format!("{seed}.png"), seed);
                plain.compute(&path).unwrap() != oversampled.compute(&path).unwrap()
            })
            .count();
        assert!(differing > 0);
    }

    #[test]
    fn test_pack_bits() {
        assert_eq!(pack_bits([true, false, true].into_iter()), vec![0b1010_0000]);
        assert_eq!(pack_bits([false; 9].into_iter()), vec![0, 0]);
        assert_eq!(median(&[3.0, 1.0, 2.0, 4.0]), 2.5);
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
    }

    #[test]
    fn test_compute_on_unreadable_image() {
        let temp_dir = TempDir::new().unwrap();
        let garbage = fixtures::write_garbage(temp_dir.path(), "broken.png");
        let missing = temp_dir.path().join("missing.png");

        let hasher = ImageHasher::default();
        assert!(matches!(
            hasher.compute(&garbage),
            Err(DigestError::Decode { .. })
        ));
        assert!(matches!(
            hasher.compute(&missing),
            Err(DigestError::Open { .. })
        ));
        assert!(hasher.compute_all(&garbage).is_empty());
    }

    #[test]
    fn test_compute_all_fills_every_variant() {
        let temp_dir = TempDir::new().unwrap();
        let path = fixtures::write_blocks(temp_dir.path(), "a.png", 7);

        let hasher = ImageHasher::default();
        let digests = hasher.compute_all(&path);

        assert_eq!(digests.iter().count(), 3);
        assert_eq!(digests.phash.as_ref(), Some(&hasher.compute(&path).unwrap()));
    }

    #[test]
    fn test_brightness_shift_stays_close() {
        let temp_dir = TempDir::new().unwrap();
        let original = fixtures::write_blocks(temp_dir.path(), "a.png", 3);
        let brighter = fixtures::write_blocks_brightened(temp_dir.path(), "b.png", 3, 2);

        let hasher = ImageHasher::new(HashSettings {
            algorithm: HashAlgorithm::AHash,
            ..HashSettings::default()
        })
        .unwrap();
        let a = hasher.compute(&original).unwrap();
        let b = hasher.compute(&brighter).unwrap();
        assert!(a.distance(&b).unwrap() <= 5);
    }

    #[test]
    fn test_distance_known_values() {
        let a = Digest::from_hex("f0f0f0f0f0f0f0f0").unwrap();
        let b = Digest::from_hex("f0f0f0f0f0f0f0f1").unwrap();
        let c = Digest::from_hex("0f0f0f0f0f0f0f0f").unwrap();

        assert_eq!(a.distance(&b).unwrap(), 1);
        assert_eq!(a.distance(&c).unwrap(), 64);
    }

    #[test]
    fn test_distance_length_mismatch() {
        let short = Digest::from_hex("f0f0").unwrap();
        let long = Digest::from_hex("f0f0f0f0f0f0f0f0").unwrap();

        assert!(matches!(
            short.distance(&long),
            Err(DigestError::LengthMismatch { left: 16, right: 64 })
        ));
    }

    #[test]
    fn test_invalid_digests() {
        assert!(Digest::from_hex("").is_err());
        assert!(Digest::from_hex("xyz").is_err());
        assert!(matches!(
            hamming_distance("zz", "00"),
            Err(DigestError::InvalidDigest(_))
        ));
    }

    #[test]
    fn test_parse_algorithm() {
        assert_eq!("phash".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::PHash);
        assert_eq!("AHash".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::AHash);
        assert_eq!(HashAlgorithm::DHash.to_string(), "dhash");
        assert!(matches!(
            "whash".parse::<HashAlgorithm>(),
            Err(DigestError::InvalidAlgorithm(_))
        ));
    }

    #[test]
    fn test_settings_validation() {
        let bad_size = HashSettings {
            hash_size: 1,
            ..HashSettings::default()
        };
        let bad_factor = HashSettings {
            highfreq_factor: 0,
            ..HashSettings::default()
        };
        assert!(ImageHasher::new(bad_size).is_err());
        assert!(ImageHasher::new(bad_factor).is_err());
    }

    fn hex_digest() -> impl Strategy<Value = String> {
        "[0-9a-f]{16}"
    }

    proptest! {
        #[test]
        fn distance_is_reflexive(hex in hex_digest()) {
            let d = Digest::from_hex(hex).unwrap();
            prop_assert_eq!(d.distance(&d).unwrap(), 0);
        }

        #[test]
        fn distance_is_symmetric_and_bounded(a in hex_digest(), b in hex_digest()) {
            let a = Digest::from_hex(a).unwrap();
            let b = Digest::from_hex(b).unwrap();
            let forward = a.distance(&b).unwrap();
            prop_assert_eq!(forward, b.distance(&a).unwrap());
            prop_assert!(forward as usize <= a.bit_width());
        }
    }
}
