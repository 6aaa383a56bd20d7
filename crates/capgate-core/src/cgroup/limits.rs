//! Resource limit tokens.
//!
//! Each known controller file has a value kind that decides how the
//! configured token is validated and normalized before it is written.
//! Unknown controller files take the token verbatim.

use capgate_common::error::LimitError;

/// Largest byte count any memory controller accepts.
const MAX_BYTES: u64 = u64::MAX >> 1;

/// How the value of a controller file is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// Byte count with an optional `k`, `m` or `g` suffix.
    Bytes {
        /// Whether the literal `max` is accepted.
        allows_max: bool,
    },
    /// Plain integer within an inclusive range.
    Integer {
        /// Smallest accepted value.
        min: u64,
        /// Largest accepted value.
        max: u64,
        /// Whether the literal `max` is accepted.
        allows_max: bool,
    },
    /// `0x`-prefixed 32-bit hexadecimal mask.
    Mask,
    /// Anything else, written as configured.
    Verbatim,
}

impl LimitKind {
    /// Returns the value kind of a controller file.
    #[must_use]
    pub fn of(setting: &str) -> Self {
        match setting {
            "memory.limit_in_bytes" | "memory.memsw.limit_in_bytes" => {
                Self::Bytes { allows_max: false }
            }
            "memory.max" | "memory.high" | "memory.swap.max" => Self::Bytes { allows_max: true },
            "cpu.shares" => Self::Integer {
                min: 2,
                max: 262_144,
                allows_max: false,
            },
            "cpu.weight" => Self::Integer {
                min: 1,
                max: 10_000,
                allows_max: false,
            },
            "pids.max" => Self::Integer {
                min: 1,
                max: MAX_BYTES,
                allows_max: true,
            },
            "net_cls.classid" => Self::Mask,
            _ => Self::Verbatim,
        }
    }
}

/// Validates `token` for `setting` and returns the text to write.
///
/// Byte counts and masks are normalized to decimal.
///
/// # Errors
///
/// Returns [`LimitError::BadSuffix`], [`LimitError::BadMask`] or
/// [`LimitError::NotANumber`] for malformed tokens and
/// [`LimitError::OutOfRange`] for values the controller cannot hold.
pub fn parse_limit(setting: &str, token: &str) -> Result<String, LimitError> {
    let token = token.trim();
    match LimitKind::of(setting) {
        LimitKind::Verbatim => Ok(token.to_string()),
        LimitKind::Bytes { allows_max } => {
            if allows_max && token == "max" {
                return Ok(token.to_string());
            }
            parse_bytes(setting, token).map(|n| n.to_string())
        }
        LimitKind::Integer {
            min,
            max,
            allows_max,
        } => {
            if allows_max && token == "max" {
                return Ok(token.to_string());
            }
            let value: u64 = token.parse().map_err(|_| LimitError::NotANumber {
                token: token.to_string(),
            })?;
            check_range(setting, token, value, min, max).map(|n| n.to_string())
        }
        LimitKind::Mask => parse_mask(token).map(|n| n.to_string()),
    }
}

/// Parses a byte count such as `"100m"` into bytes.
///
/// Suffixes are binary multiples and case-insensitive.
///
/// # Errors
///
/// See [`parse_limit`].
pub fn parse_bytes(setting: &str, token: &str) -> Result<u64, LimitError> {
    let split = token
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(token.len());
    let (digits, suffix) = token.split_at(split);
    if digits.is_empty() {
        return Err(LimitError::NotANumber {
            token: token.to_string(),
        });
    }
    let multiplier: u64 = match suffix.to_ascii_lowercase().as_str() {
        "" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        _ => {
            return Err(LimitError::BadSuffix {
                token: token.to_string(),
            });
        }
    };
    let out_of_range = || LimitError::OutOfRange {
        setting: setting.to_string(),
        token: token.to_string(),
        min: 0,
        max: MAX_BYTES,
    };
    let value: u64 = digits.parse().map_err(|_| out_of_range())?;
    let bytes = value.checked_mul(multiplier).ok_or_else(out_of_range)?;
    check_range(setting, token, bytes, 0, MAX_BYTES)
}

fn parse_mask(token: &str) -> Result<u32, LimitError> {
    let bad = || LimitError::BadMask {
        token: token.to_string(),
    };
    let hex = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .ok_or_else(bad)?;
    if hex.is_empty() || hex.len() > 8 {
        return Err(bad());
    }
    u32::from_str_radix(hex, 16).map_err(|_| bad())
}

fn check_range(
    setting: &str,
    token: &str,
    value: u64,
    min: u64,
    max: u64,
) -> Result<u64, LimitError> {
    if (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(LimitError::OutOfRange {
            setting: setting.to_string(),
            token: token.to_string(),
            min,
            max,
        })
    }
}
