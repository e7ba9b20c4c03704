//! Synthetic row generation.
//!
//! Every worker owns one [`RowGenerator`] with its own `SmallRng`, so no random
//! state is shared between tasks. Keys always land inside the owning
//! partition's [`KeyRange`]:
//!
//! - **contiguous**: `lo + base + i` for `i in 0..batch`, where `base` is drawn
//!   from `0..=(width - batch)` so the last row of the batch still fits
//! - **scattered**: `lo + random(width)` independently for every row

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::HarnessError;
use crate::schema::KeyRange;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// How keys are laid out within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyPattern {
    /// Consecutive keys starting at a random base.
    #[default]
    Contiguous,
    /// Independent random key per row.
    Scattered,
}

impl std::str::FromStr for KeyPattern {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "contiguous" => Ok(KeyPattern::Contiguous),
            "scattered" => Ok(KeyPattern::Scattered),
            other => Err(HarnessError::Config(format!(
                "unknown key pattern: '{}'",
                other
            ))),
        }
    }
}

/// One row to insert: the partition key plus fixed-width text payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticRow {
    pub key: i64,
    pub fields: Vec<String>,
}

/// Uniform alphanumeric string of exactly `len` characters.
pub fn random_string<R: Rng + ?Sized>(rng: &mut R, len: usize) -> String {
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

/// First key of a contiguous batch. `base + batch - 1` stays below the range
/// width whenever `batch <= width`.
pub fn batch_base<R: Rng + ?Sized>(rng: &mut R, range: KeyRange, batch: usize) -> i64 {
    let span = (range.width() - batch as i64 + 1).max(1);
    range.lo + rng.gen_range(0..span)
}

pub fn scattered_key<R: Rng + ?Sized>(rng: &mut R, range: KeyRange) -> i64 {
    range.lo + rng.gen_range(0..range.width().max(1))
}

/// Per-worker row source.
pub struct RowGenerator {
    rng: SmallRng,
    pattern: KeyPattern,
    widths: Vec<usize>,
}

impl RowGenerator {
    /// `widths` holds one entry per text column. Without a seed the RNG is
    /// seeded from OS entropy.
    pub fn new(widths: Vec<usize>, pattern: KeyPattern, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Self {
            rng,
            pattern,
            widths,
        }
    }

    /// Generate `batch` rows whose keys all fall in `range`.
    pub fn batch(&mut self, range: KeyRange, batch: usize) -> Vec<SyntheticRow> {
        let width = range.width().max(1);
        let base = match self.pattern {
            KeyPattern::Contiguous => batch_base(&mut self.rng, range, batch) - range.lo,
            KeyPattern::Scattered => 0,
        };

        (0..batch)
            .map(|i| {
                let key = match self.pattern {
                    // Wraps only if batch > width, which config validation forbids.
                    KeyPattern::Contiguous => range.lo + (base + i as i64) % width,
                    KeyPattern::Scattered => scattered_key(&mut self.rng, range),
                };
                let fields = self
                    .widths
                    .iter()
                    .map(|&w| random_string(&mut self.rng, w))
                    .collect();
                SyntheticRow { key, fields }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_string_length_and_alphabet() {
        let mut rng = SmallRng::seed_from_u64(7);
        for len in [0, 1, 64, 128] {
            let s = random_string(&mut rng, len);
            assert_eq!(s.len(), len);
            assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn test_batch_base_fits_whole_batch() {
        let mut rng = SmallRng::seed_from_u64(1);
        let range = KeyRange::new(5000, 10000);
        for _ in 0..10_000 {
            let base = batch_base(&mut rng, range, 64);
            assert!(base >= 5000);
            assert!(base + 63 < 10000);
        }
    }

    #[test]
    fn test_batch_equal_to_width() {
        let mut rng = SmallRng::seed_from_u64(2);
        let range = KeyRange::new(0, 8);
        assert_eq!(batch_base(&mut rng, range, 8), 0);
    }

    #[test]
    fn test_contiguous_batch_keys() {
        let mut generator = RowGenerator::new(vec![4, 8], KeyPattern::Contiguous, Some(42));
        let range = KeyRange::new(0, 100);
        for _ in 0..500 {
            let rows = generator.batch(range, 10);
            assert_eq!(rows.len(), 10);
            for pair in rows.windows(2) {
                assert_eq!(pair[1].key, pair[0].key + 1);
            }
            for row in &rows {
                assert!(range.contains(row.key));
                assert_eq!(row.fields[0].len(), 4);
                assert_eq!(row.fields[1].len(), 8);
            }
        }
    }

    #[test]
    fn test_scattered_batch_keys_in_range() {
        let mut generator = RowGenerator::new(vec![1], KeyPattern::Scattered, Some(9));
        let range = KeyRange::new(15000, 20000);
        for _ in 0..200 {
            for row in generator.batch(range, 64) {
                assert!(range.contains(row.key), "key {} escaped {}", row.key, range);
            }
        }
    }

    #[test]
    fn test_oversized_batch_still_in_range() {
        let mut generator = RowGenerator::new(vec![], KeyPattern::Contiguous, Some(3));
        let range = KeyRange::new(10, 15);
        let rows = generator.batch(range, 12);
        assert_eq!(rows.len(), 12);
        assert!(rows.iter().all(|r| range.contains(r.key)));
    }

    #[test]
    fn test_seeded_generators_repeat() {
        let range = KeyRange::new(0, 5000);
        let mut a = RowGenerator::new(vec![16], KeyPattern::Contiguous, Some(11));
        let mut b = RowGenerator::new(vec![16], KeyPattern::Contiguous, Some(11));
        assert_eq!(a.batch(range, 4), b.batch(range, 4));
    }

    #[test]
    fn test_key_pattern_from_str() {
        assert_eq!("Scattered".parse::<KeyPattern>().unwrap(), KeyPattern::Scattered);
        assert!("striped".parse::<KeyPattern>().is_err());
    }
}
