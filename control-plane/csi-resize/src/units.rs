//! Capacity units.
//!
//! Users request capacity as kubernetes quantities (`3Gi`, `500M`, `1.5Gi`, `2e9`), the
//! storage backend allocates in whole mebibytes. Conversions use integer arithmetic
//! only and always round up: a fractional byte becomes a whole byte and a partial
//! mebibyte becomes a whole mebibyte, so the backend never allocates less than asked.

use crate::error::Error;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use once_cell::sync::Lazy;
use regex::Regex;

/// One kibibyte.
pub const KIB: u64 = 1024;
/// One mebibyte, the backend allocation unit.
pub const MIB: u64 = 1024 * KIB;
/// One gibibyte.
pub const GIB: u64 = 1024 * MIB;

static QUANTITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<sign>[+-])?(?P<int>[0-9]*)(?:\.(?P<frac>[0-9]*))?(?P<suffix>Ki|Mi|Gi|Ti|Pi|Ei|[numkMGTPE]|[eE][+-]?[0-9]+)?$",
    )
    .expect("quantity regex is valid")
});

/// Scaling applied by a quantity suffix.
enum Scale {
    /// Multiply by the value.
    Mul(u128),
    /// Divide by the value.
    Div(u128),
}

fn suffix_scale(suffix: &str) -> Option<Scale> {
    let binary = |exp: u32| Scale::Mul(1u128 << (10 * exp));
    let decimal = |exp: i32| match exp {
        exp if exp >= 0 => 10u128.checked_pow(exp as u32).map(Scale::Mul),
        exp => 10u128.checked_pow(exp.unsigned_abs()).map(Scale::Div),
    };
    match suffix {
        "" => Some(Scale::Mul(1)),
        "Ki" => Some(binary(1)),
        "Mi" => Some(binary(2)),
        "Gi" => Some(binary(3)),
        "Ti" => Some(binary(4)),
        "Pi" => Some(binary(5)),
        "Ei" => Some(binary(6)),
        "n" => decimal(-9),
        "u" => decimal(-6),
        "m" => decimal(-3),
        "k" => decimal(3),
        "M" => decimal(6),
        "G" => decimal(9),
        "T" => decimal(12),
        "P" => decimal(15),
        "E" => decimal(18),
        exponent => exponent
            .get(1 ..)
            .and_then(|exp| exp.parse::<i32>().ok())
            .and_then(decimal),
    }
}

fn div_ceil(value: u128, divisor: u128) -> u128 {
    (value + divisor - 1) / divisor
}

/// Parse a kubernetes quantity string into bytes, rounding fractional bytes up.
pub fn parse_quantity(quantity: &str) -> Result<u64, Error> {
    let invalid = || Error::InvalidQuantity {
        quantity: quantity.to_string(),
    };
    let captures = QUANTITY.captures(quantity.trim()).ok_or_else(invalid)?;

    let int = captures.name("int").map_or("", |m| m.as_str());
    let frac = captures.name("frac").map_or("", |m| m.as_str());
    if int.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    if captures.name("sign").map(|m| m.as_str()) == Some("-") {
        return Err(Error::InvalidCapacity {
            value: quantity.to_string(),
            reason: "capacity cannot be negative".to_string(),
        });
    }

    let digits = format!("{int}{frac}");
    let mantissa = if digits.is_empty() {
        0
    } else {
        digits.parse::<u128>().map_err(|_| invalid())?
    };
    let frac_divisor = 10u128.checked_pow(frac.len() as u32).ok_or_else(invalid)?;
    let scale = suffix_scale(captures.name("suffix").map_or("", |m| m.as_str())).ok_or_else(invalid)?;

    let bytes = match scale {
        Scale::Mul(factor) => {
            let scaled = mantissa.checked_mul(factor).ok_or_else(invalid)?;
            div_ceil(scaled, frac_divisor)
        }
        Scale::Div(divisor) => {
            let divisor = divisor.checked_mul(frac_divisor).ok_or_else(invalid)?;
            div_ceil(mantissa, divisor)
        }
    };
    u64::try_from(bytes).map_err(|_| Error::InvalidCapacity {
        value: quantity.to_string(),
        reason: "capacity overflows 64 bits".to_string(),
    })
}

/// Parse the bytes of a kubernetes `Quantity`.
pub fn quantity_bytes(quantity: &Quantity) -> Result<u64, Error> {
    parse_quantity(&quantity.0)
}

/// Convert bytes into backend allocation units, rounding up to the next whole MiB.
pub fn bytes_to_mib(bytes: u64) -> u64 {
    bytes / MIB + u64::from(bytes % MIB != 0)
}

/// Convert backend allocation units into bytes.
pub fn mib_to_bytes(mib: u64) -> u64 {
    mib.saturating_mul(MIB)
}

/// Express bytes as the most compact exact binary quantity.
pub fn bytes_to_quantity(bytes: u64) -> Quantity {
    let value = match bytes {
        0 => "0".to_string(),
        bytes if bytes % GIB == 0 => format!("{}Gi", bytes / GIB),
        bytes if bytes % MIB == 0 => format!("{}Mi", bytes / MIB),
        bytes if bytes % KIB == 0 => format!("{}Ki", bytes / KIB),
        bytes => bytes.to_string(),
    };
    Quantity(value)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn binary_suffixes() {
        assert_eq!(parse_quantity("2Gi").unwrap(), 2 * GIB);
        assert_eq!(parse_quantity("500Mi").unwrap(), 500 * MIB);
        assert_eq!(parse_quantity("1Ki").unwrap(), KIB);
        assert_eq!(parse_quantity("1.5Gi").unwrap(), 1536 * MIB);
    }

    #[test]
    fn decimal_suffixes() {
        assert_eq!(parse_quantity("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_quantity("2e9").unwrap(), 2_000_000_000);
        assert_eq!(parse_quantity("1500").unwrap(), 1500);
        // fractional bytes are rounded up
        assert_eq!(parse_quantity("1500m").unwrap(), 2);
        assert_eq!(parse_quantity("0.5").unwrap(), 1);
    }

    #[test]
    fn invalid_quantities() {
        assert!(matches!(
            parse_quantity("abc"),
            Err(Error::InvalidQuantity { .. })
        ));
        assert!(matches!(parse_quantity(""), Err(Error::InvalidQuantity { .. })));
        assert!(matches!(
            parse_quantity("3Gb"),
            Err(Error::InvalidQuantity { .. })
        ));
        assert!(matches!(
            parse_quantity("-1Gi"),
            Err(Error::InvalidCapacity { .. })
        ));
        assert!(matches!(
            parse_quantity("100Ei"),
            Err(Error::InvalidCapacity { .. })
        ));
    }

    #[test]
    fn allocation_units() {
        assert_eq!(bytes_to_mib(3 * GIB), 3072);
        assert_eq!(bytes_to_mib(13 * GIB), 13312);
        assert_eq!(bytes_to_mib(1), 1);
        assert_eq!(bytes_to_mib(MIB + 1), 2);
        assert_eq!(bytes_to_mib(0), 0);
        // 1G is not a whole number of MiB
        assert_eq!(bytes_to_mib(1_000_000_000), 954);
        assert_eq!(mib_to_bytes(3072), 3 * GIB);
    }

    #[test]
    fn quantities() {
        assert_eq!(bytes_to_quantity(3 * GIB).0, "3Gi");
        assert_eq!(bytes_to_quantity(3073 * MIB).0, "3073Mi");
        assert_eq!(bytes_to_quantity(1000).0, "1000");
        assert_eq!(
            quantity_bytes(&bytes_to_quantity(13 * GIB)).unwrap(),
            13 * GIB
        );
    }
}
