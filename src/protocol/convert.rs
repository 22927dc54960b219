//! Typed conversion of SCPI response text.
//!
//! Every typed query goes through [`convert`], which trims the response and
//! hands it to the target's [`FromScpi`] impl. Supported targets:
//!
//! | Target | Accepted text |
//! |--------|---------------|
//! | `String` | anything, passed through |
//! | `f32`, `f64` | `12.345`, `+1.2E-3`, `NAN`, `INF` |
//! | `i32`, `i64`, `u8`, `u32` | `42`, `+42`, or an integral float such as `+4.200000E+01` |
//! | `bool` | any integer (non-zero is true), `TRUE`/`ON`/`YES`, `FALSE`/`OFF`/`NO` |
//! | [`ScpiEnum`] types | variant ordinal or case-insensitive name |
//! | `NaiveDateTime`, `DateTime<Utc>` | RFC 3339 and the common instrument date formats |
//! | `Vec<u8>`, `Vec<i32>`, `Vec<i64>`, `Vec<f32>`, `Vec<f64>` | comma-separated elements |
//!
//! Parsing never depends on the process locale. Failures are
//! `InvalidResponse` errors carrying the substring that did not parse.

use crate::error::{LabError, LabResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// A type that can be produced from a trimmed SCPI response.
pub trait FromScpi: Sized {
    /// Whether an empty response is a valid value.
    const ACCEPTS_EMPTY: bool = false;

    /// Parse already-trimmed, non-empty (unless `ACCEPTS_EMPTY`) text.
    fn from_scpi(text: &str) -> LabResult<Self>;
}

/// Convert a raw response to `T`.
pub fn convert<T: FromScpi>(response: &str) -> LabResult<T> {
    let text = response.trim();
    if text.is_empty() && !T::ACCEPTS_EMPTY {
        return Err(LabError::invalid_response(
            response,
            format!("empty response cannot be read as {}", std::any::type_name::<T>()),
        ));
    }
    T::from_scpi(text)
}

/// Enumerations that instruments report either by number or by name.
///
/// ```rust
/// use labmon::protocol::{convert, ScpiEnum};
///
/// #[derive(Debug, Clone, Copy, PartialEq)]
/// enum Trigger { Immediate, Bus, External }
///
/// impl ScpiEnum for Trigger {
///     const VARIANTS: &'static [(i64, &'static str, Self)] = &[
///         (0, "IMM", Trigger::Immediate),
///         (1, "BUS", Trigger::Bus),
///         (2, "EXT", Trigger::External),
///     ];
/// }
///
/// assert_eq!(convert::<Trigger>("2").unwrap(), Trigger::External);
/// assert_eq!(convert::<Trigger>("bus").unwrap(), Trigger::Bus);
/// ```
pub trait ScpiEnum: Sized + Copy + 'static {
    /// `(ordinal, name, variant)` for every variant.
    const VARIANTS: &'static [(i64, &'static str, Self)];
}

impl<E: ScpiEnum> FromScpi for E {
    fn from_scpi(text: &str) -> LabResult<Self> {
        let by_ordinal = text
            .parse::<i64>()
            .ok()
            .and_then(|n| E::VARIANTS.iter().find(|(ordinal, _, _)| *ordinal == n));
        let found = by_ordinal.or_else(|| {
            E::VARIANTS
                .iter()
                .find(|(_, name, _)| name.eq_ignore_ascii_case(text))
        });
        found.map(|(_, _, variant)| *variant).ok_or_else(|| {
            LabError::invalid_response(
                text,
                format!("no {} variant matches", std::any::type_name::<E>()),
            )
        })
    }
}

impl FromScpi for String {
    const ACCEPTS_EMPTY: bool = true;

    fn from_scpi(text: &str) -> LabResult<Self> {
        Ok(text.to_string())
    }
}

macro_rules! float_from_scpi {
    ($($ty:ty),*) => {$(
        impl FromScpi for $ty {
            fn from_scpi(text: &str) -> LabResult<Self> {
                text.parse::<$ty>().map_err(|e| {
                    LabError::invalid_response(text, concat!("not a valid ", stringify!($ty)))
                        .with_source(e)
                })
            }
        }
    )*};
}

float_from_scpi!(f32, f64);

macro_rules! integer_from_scpi {
    ($($ty:ty),*) => {$(
        impl FromScpi for $ty {
            fn from_scpi(text: &str) -> LabResult<Self> {
                if let Ok(value) = text.parse::<$ty>() {
                    return Ok(value);
                }
                // NR3 replies such as "+4.000000E+00"
                text.parse::<f64>()
                    .ok()
                    .filter(|v| v.fract() == 0.0 && *v >= <$ty>::MIN as f64 && *v <= <$ty>::MAX as f64)
                    .map(|v| v as $ty)
                    .ok_or_else(|| {
                        LabError::invalid_response(text, concat!("not a valid ", stringify!($ty)))
                    })
            }
        }
    )*};
}

integer_from_scpi!(u8, i32, u32, i64);

impl FromScpi for bool {
    fn from_scpi(text: &str) -> LabResult<Self> {
        if let Ok(n) = i64::from_scpi(text) {
            return Ok(n != 0);
        }
        match text.to_ascii_uppercase().as_str() {
            "TRUE" | "ON" | "YES" => Ok(true),
            "FALSE" | "OFF" | "NO" => Ok(false),
            _ => Err(LabError::invalid_response(text, "not a valid boolean")),
        }
    }
}

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S%.f",
    "%Y,%m,%d,%H,%M,%S%.f",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y,%m,%d"];

impl FromScpi for NaiveDateTime {
    fn from_scpi(text: &str) -> LabResult<Self> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Ok(dt.naive_utc());
        }
        let text_nospace = text.replace(", ", ",");
        DATETIME_FORMATS
            .iter()
            .find_map(|fmt| NaiveDateTime::parse_from_str(&text_nospace, fmt).ok())
            .or_else(|| {
                DATE_FORMATS
                    .iter()
                    .find_map(|fmt| NaiveDate::parse_from_str(&text_nospace, fmt).ok())
                    .and_then(|date| date.and_hms_opt(0, 0, 0))
            })
            .ok_or_else(|| LabError::invalid_response(text, "not a recognised timestamp"))
    }
}

impl FromScpi for DateTime<Utc> {
    fn from_scpi(text: &str) -> LabResult<Self> {
        // Naive timestamps are taken as UTC
        NaiveDateTime::from_scpi(text).map(|naive| naive.and_utc())
    }
}

macro_rules! list_from_scpi {
    ($($ty:ty),*) => {$(
        impl FromScpi for Vec<$ty> {
            fn from_scpi(text: &str) -> LabResult<Self> {
                text.split(',')
                    .map(|element| {
                        let element = element.trim();
                        if element.is_empty() {
                            return Err(LabError::invalid_response(
                                text,
                                "empty element in list response",
                            ));
                        }
                        <$ty>::from_scpi(element)
                    })
                    .collect()
            }
        }
    )*};
}

list_from_scpi!(u8, i32, i64, f32, f64);
