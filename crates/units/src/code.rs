use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use unitledger_core::{DomainError, DomainResult, ValueObject};

use crate::quantity::Quantity;

/// Fixed prefix of every legacy code.
pub const CODE_PREFIX: &str = "LEG";

/// Suffixes are zero-padded to at least this many digits. Wider suffixes are
/// printed in full, never truncated.
pub const MIN_SUFFIX_WIDTH: usize = 4;

/// Human-readable, per-project unique unit identifier (`LEG0001`, `LEG0002`, ...).
///
/// Ordering and equality follow the numeric suffix, so `LEG10000` sorts after
/// `LEG9999` even though the display string does not.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LegacyCode {
    suffix: u64,
}

impl ValueObject for LegacyCode {}

impl LegacyCode {
    /// Largest suffix the code space supports (storage keeps suffixes as signed 64-bit).
    pub const MAX_SUFFIX: u64 = i64::MAX as u64;

    /// Build a code from its numeric suffix. Suffix `0` is the `LEG0000` seed
    /// and is never issued.
    pub fn new(suffix: u64) -> DomainResult<Self> {
        if suffix == 0 {
            return Err(DomainError::invalid_code("suffix 0 is reserved for the seed"));
        }
        if suffix > Self::MAX_SUFFIX {
            return Err(DomainError::invalid_code(format!(
                "suffix {suffix} exceeds {}",
                Self::MAX_SUFFIX
            )));
        }
        Ok(Self { suffix })
    }

    pub fn suffix(&self) -> u64 {
        self.suffix
    }

    /// The code directly after this one.
    pub fn next(&self) -> DomainResult<Self> {
        let next = self
            .suffix
            .checked_add(1)
            .ok_or_else(|| DomainError::invariant("legacy code suffix overflow"))?;
        Self::new(next)
    }
}

impl core::fmt::Display for LegacyCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{CODE_PREFIX}{:0width$}",
            self.suffix,
            width = MIN_SUFFIX_WIDTH
        )
    }
}

impl FromStr for LegacyCode {
    type Err = DomainError;

    /// Accepts only the canonical form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix(CODE_PREFIX)
            .ok_or_else(|| DomainError::invalid_code(format!("{s:?}: missing {CODE_PREFIX} prefix")))?;

        if digits.len() < MIN_SUFFIX_WIDTH || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DomainError::invalid_code(format!(
                "{s:?}: expected at least {MIN_SUFFIX_WIDTH} decimal digits"
            )));
        }
        if digits.len() > MIN_SUFFIX_WIDTH && digits.starts_with('0') {
            return Err(DomainError::invalid_code(format!(
                "{s:?}: over-padded suffix"
            )));
        }

        let suffix = digits
            .parse::<u64>()
            .map_err(|e| DomainError::invalid_code(format!("{s:?}: {e}")))?;
        Self::new(suffix)
    }
}

impl Serialize for LegacyCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LegacyCode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Plan `quantity` consecutive codes following the current maximum suffix
/// (`0` when the project has no units yet).
pub fn plan_codes(max_suffix: u64, quantity: Quantity) -> DomainResult<Vec<LegacyCode>> {
    let count = u64::from(quantity.get());
    let last = max_suffix
        .checked_add(count)
        .filter(|last| *last <= LegacyCode::MAX_SUFFIX)
        .ok_or_else(|| {
            DomainError::invariant(format!(
                "allocating {count} codes after suffix {max_suffix} overflows the code space"
            ))
        })?;

    ((max_suffix + 1)..=last).map(LegacyCode::new).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn qty(n: i64) -> Quantity {
        Quantity::new(n).unwrap()
    }

    #[test]
    fn display_pads_to_four_digits() {
        assert_eq!(LegacyCode::new(1).unwrap().to_string(), "LEG0001");
        assert_eq!(LegacyCode::new(42).unwrap().to_string(), "LEG0042");
        assert_eq!(LegacyCode::new(9999).unwrap().to_string(), "LEG9999");
    }

    #[test]
    fn display_widens_past_four_digits() {
        assert_eq!(LegacyCode::new(10_000).unwrap().to_string(), "LEG10000");
        assert_eq!(LegacyCode::new(123_456).unwrap().to_string(), "LEG123456");
    }

    #[test]
    fn ordering_is_numeric_not_lexicographic() {
        let a: LegacyCode = "LEG9999".parse().unwrap();
        let b: LegacyCode = "LEG10000".parse().unwrap();
        assert!(a < b);
        assert!(a.to_string() > b.to_string());
    }

    #[test]
    fn seed_is_never_a_valid_code() {
        assert!(LegacyCode::new(0).is_err());
        assert!("LEG0000".parse::<LegacyCode>().is_err());
    }

    #[test]
    fn parse_rejects_non_canonical_forms() {
        for bad in ["", "LEG", "LEG1", "LEG001", "leg0001", "LEG00001", "LEG00a1", "XYZ0001", "LEG-001"] {
            assert!(bad.parse::<LegacyCode>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn plan_on_empty_project_starts_at_one() {
        let codes = plan_codes(0, qty(3)).unwrap();
        let rendered: Vec<String> = codes.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["LEG0001", "LEG0002", "LEG0003"]);
    }

    #[test]
    fn plan_continues_after_existing_max() {
        let codes = plan_codes(7, qty(2)).unwrap();
        let rendered: Vec<String> = codes.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["LEG0008", "LEG0009"]);
    }

    #[test]
    fn plan_crosses_the_padding_boundary() {
        let codes = plan_codes(9_998, qty(3)).unwrap();
        let rendered: Vec<String> = codes.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["LEG9999", "LEG10000", "LEG10001"]);
    }

    #[test]
    fn plan_refuses_to_overflow_code_space() {
        let err = plan_codes(LegacyCode::MAX_SUFFIX, qty(1)).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn codes_serialize_as_display_strings() {
        let code = LegacyCode::new(8).unwrap();
        assert_eq!(serde_json::to_string(&code).unwrap(), "\"LEG0008\"");
        let back: LegacyCode = serde_json::from_str("\"LEG0008\"").unwrap();
        assert_eq!(back, code);
        assert!(serde_json::from_str::<LegacyCode>("\"LEG8\"").is_err());
    }

    proptest! {
        #[test]
        fn planned_codes_are_consecutive_after_max(max in 0u64..1_000_000, n in 1i64..200) {
            let codes = plan_codes(max, qty(n)).unwrap();
            prop_assert_eq!(codes.len() as i64, n);
            prop_assert_eq!(codes[0].suffix(), max + 1);
            for pair in codes.windows(2) {
                prop_assert_eq!(pair[1].suffix(), pair[0].suffix() + 1);
            }
        }

        #[test]
        fn rendered_codes_parse_back_to_the_same_suffix(suffix in 1u64..10_000_000_000) {
            let code = LegacyCode::new(suffix).unwrap();
            let text = code.to_string();
            prop_assert!(text.len() >= CODE_PREFIX.len() + MIN_SUFFIX_WIDTH);
            prop_assert_eq!(text.parse::<LegacyCode>().unwrap(), code);
        }
    }
}
