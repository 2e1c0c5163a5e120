use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use lazy_static::lazy_static;
use regex::Regex;

/// Parses the storage quantities found in `spec.resources.requests` into
/// byte counts usable as `zfs` quota values.
///
/// Binary suffixes (Ki/Mi/Gi/Ti/Pi/Ei) and decimal suffixes (k/K/M/G/T/P/E)
/// are both accepted; fractional amounts round up to a whole number of bytes.
pub trait QuantityParser {
    fn to_bytes(&self) -> Result<u64>;
}

fn suffix_multiplier(suffix: &str) -> Option<u64> {
    let multiplier = match suffix {
        "Ki" => 1u64 << 10,
        "Mi" => 1u64 << 20,
        "Gi" => 1u64 << 30,
        "Ti" => 1u64 << 40,
        "Pi" => 1u64 << 50,
        "Ei" => 1u64 << 60,
        "k" | "K" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        "E" => 1_000_000_000_000_000_000,
        _ => return None,
    };
    Some(multiplier)
}

impl QuantityParser for Quantity {
    fn to_bytes(&self) -> Result<u64> {
        lazy_static! {
            static ref QUANTITY_REGEX: Regex =
                Regex::new(r"^([0-9]+(?:\.[0-9]+)?)([A-Za-z]{1,2})?$").unwrap();
        }

        let captures = QUANTITY_REGEX
            .captures(self.0.trim())
            .ok_or_else(|| eyre!("invalid quantity: '{}'", self.0))?;

        let amount = captures.get(1).unwrap().as_str();
        let multiplier = match captures.get(2) {
            Some(suffix) => suffix_multiplier(suffix.as_str())
                .ok_or_else(|| eyre!("invalid quantity suffix: '{}'", suffix.as_str()))?,
            None => 1,
        };

        if let Ok(whole) = amount.parse::<u64>() {
            return whole
                .checked_mul(multiplier)
                .ok_or_else(|| eyre!("quantity out of range: '{}'", self.0));
        }

        // Fractional amounts like "1.5Gi" round up to whole bytes.
        let fractional = amount.parse::<f64>()?;
        let bytes = (fractional * multiplier as f64).ceil();
        if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
            bail!("quantity out of range: '{}'", self.0);
        }

        Ok(bytes as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_bytes() {
        assert_eq!(Quantity("12345".into()).to_bytes().unwrap(), 12345);
    }

    #[test]
    fn binary_suffixes() {
        assert_eq!(Quantity("1Ki".into()).to_bytes().unwrap(), 1024);
        assert_eq!(Quantity("1Gi".into()).to_bytes().unwrap(), 1_073_741_824);
        assert_eq!(Quantity("2Gi".into()).to_bytes().unwrap(), 2_147_483_648);
    }

    #[test]
    fn decimal_suffixes() {
        assert_eq!(Quantity("500M".into()).to_bytes().unwrap(), 500_000_000);
        assert_eq!(Quantity("1G".into()).to_bytes().unwrap(), 1_000_000_000);
        assert_eq!(Quantity("2k".into()).to_bytes().unwrap(), 2_000);
        assert_eq!(Quantity("2K".into()).to_bytes().unwrap(), 2_000);
    }

    #[test]
    fn fractional_rounds_up() {
        assert_eq!(Quantity("1.5Gi".into()).to_bytes().unwrap(), 1_610_612_736);
        assert_eq!(Quantity("0.1k".into()).to_bytes().unwrap(), 100);
        assert_eq!(Quantity("1.0001k".into()).to_bytes().unwrap(), 1_001);
    }

    #[test]
    fn invalid_unit_fails() {
        assert!(Quantity("12345r".into()).to_bytes().is_err());
        assert!(Quantity("1GiB".into()).to_bytes().is_err());
    }

    #[test]
    fn garbage_fails() {
        assert!(Quantity("garbage".into()).to_bytes().is_err());
        assert!(Quantity("".into()).to_bytes().is_err());
        assert!(Quantity("-1Gi".into()).to_bytes().is_err());
    }

    #[test]
    fn overflow_fails() {
        assert!(Quantity("999999999999Ei".into()).to_bytes().is_err());
    }
}
