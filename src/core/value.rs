//! String codecs for the value types a flag can hold.

use std::time::Duration;

/// A type that can live inside a [`DynamicValue`](crate::core::DynamicValue).
///
/// Every flag is exchanged with the outside world as a raw string: files in a
/// mounted directory, values in a key-value store, or an operator typing into
/// a setter. `parse_flag` turns that string into the typed value and
/// `render_flag` produces the string that `parse_flag` accepts back.
///
/// `Default` provides the value reported by a box that was never initialized.
pub trait FlagValue: Default + Send + Sync + 'static {
    /// Parse a normalized raw string.
    ///
    /// # Errors
    ///
    /// Returns a human readable reason when the input is malformed.
    fn parse_flag(raw: &str) -> std::result::Result<Self, String>;

    /// Render the value in the form `parse_flag` accepts.
    fn render_flag(&self) -> String;
}

impl FlagValue for bool {
    fn parse_flag(raw: &str) -> std::result::Result<Self, String> {
        match raw {
            "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
            "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
            other => Err(format!("invalid boolean literal '{}'", other)),
        }
    }

    fn render_flag(&self) -> String {
        self.to_string()
    }
}

macro_rules! numeric_flag_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FlagValue for $ty {
                fn parse_flag(raw: &str) -> std::result::Result<Self, String> {
                    raw.parse::<$ty>()
                        .map_err(|e| format!("'{}' is not a valid {}: {}", raw, stringify!($ty), e))
                }

                fn render_flag(&self) -> String {
                    self.to_string()
                }
            }
        )*
    };
}

numeric_flag_value!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64);

impl FlagValue for String {
    fn parse_flag(raw: &str) -> std::result::Result<Self, String> {
        Ok(raw.to_string())
    }

    fn render_flag(&self) -> String {
        self.clone()
    }
}

/// Comma separated list. Entries are trimmed and an empty input is an empty list.
impl FlagValue for Vec<String> {
    fn parse_flag(raw: &str) -> std::result::Result<Self, String> {
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(raw.split(',').map(|item| item.trim().to_string()).collect())
    }

    fn render_flag(&self) -> String {
        self.join(",")
    }
}

/// Durations use the `1h30m`, `250ms`, `1.5s` notation.
impl FlagValue for Duration {
    fn parse_flag(raw: &str) -> std::result::Result<Self, String> {
        parse_duration(raw)
    }

    fn render_flag(&self) -> String {
        render_duration(*self)
    }
}

const NANOS_PER_SEC: u128 = 1_000_000_000;

fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    if raw == "0" {
        return Ok(Duration::ZERO);
    }
    if raw.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut rest = raw;
    let mut total: u128 = 0;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_end == 0 {
            return Err(format!("invalid duration '{}': expected a number", raw));
        }
        let number = &rest[..number_end];
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = &rest[unit_end..];

        let scale: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => NANOS_PER_SEC,
            "m" => 60 * NANOS_PER_SEC,
            "h" => 3_600 * NANOS_PER_SEC,
            "" => return Err(format!("invalid duration '{}': missing unit", raw)),
            other => {
                return Err(format!("invalid duration '{}': unknown unit '{}'", raw, other));
            }
        };

        let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && frac.is_empty() {
            return Err(format!("invalid duration '{}'", raw));
        }
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| format!("invalid duration '{}'", raw))?
        };
        let mut nanos = whole
            .checked_mul(scale)
            .ok_or_else(|| format!("duration '{}' overflows", raw))?;

        let mut numerator: u128 = 0;
        let mut denominator: u128 = 1;
        for c in frac.chars().take(20) {
            let digit = c
                .to_digit(10)
                .ok_or_else(|| format!("invalid duration '{}'", raw))?;
            numerator = numerator * 10 + u128::from(digit);
            denominator *= 10;
        }
        nanos = nanos
            .checked_add(numerator * scale / denominator)
            .ok_or_else(|| format!("duration '{}' overflows", raw))?;

        total = total
            .checked_add(nanos)
            .ok_or_else(|| format!("duration '{}' overflows", raw))?;
    }

    let secs = u64::try_from(total / NANOS_PER_SEC)
        .map_err(|_| format!("duration '{}' overflows", raw))?;
    // The remainder is always below one second.
    let subsec = (total % NANOS_PER_SEC) as u32;
    Ok(Duration::new(secs, subsec))
}

fn render_duration(d: Duration) -> String {
    let nanos = d.as_nanos();
    if nanos == 0 {
        return "0s".to_string();
    }
    if nanos < 1_000 {
        return format!("{}ns", nanos);
    }
    if nanos < 1_000_000 {
        return format!("{}µs", decimal(nanos, 1_000, 3));
    }
    if nanos < NANOS_PER_SEC {
        return format!("{}ms", decimal(nanos, 1_000_000, 6));
    }

    let total_secs = d.as_secs();
    let hours = total_secs / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let seconds = u128::from(total_secs % 60) * NANOS_PER_SEC + u128::from(d.subsec_nanos());

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    out.push_str(&format!("{}s", decimal(seconds, NANOS_PER_SEC, 9)));
    out
}

fn decimal(value: u128, unit: u128, width: usize) -> String {
    let whole = value / unit;
    let frac = value % unit;
    if frac == 0 {
        return whole.to_string();
    }
    let digits = format!("{:0width$}", frac, width = width);
    format!("{}.{}", whole, digits.trim_end_matches('0'))
}

/// A structured flag decoded from JSON.
///
/// Each successful set decodes a brand-new `T`; readers holding the previous
/// snapshot keep seeing it unchanged.
///
/// ```rust
/// use hotswap_flags::core::{DynamicValue, Json};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
/// struct Limits {
///     burst: u32,
///     per_second: u32,
/// }
///
/// let limits = DynamicValue::new("limits", Json(Limits { burst: 10, per_second: 5 }));
/// limits.set(r#"{"burst": 20, "per_second": 8}"#).unwrap();
/// assert_eq!(limits.get().burst, 20);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Json<T>(pub T);

#[cfg(feature = "json")]
impl<T> std::ops::Deref for Json<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

#[cfg(feature = "json")]
impl<T> FlagValue for Json<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Default + Send + Sync + 'static,
{
    fn parse_flag(raw: &str) -> std::result::Result<Self, String> {
        serde_json::from_str(raw)
            .map(Json)
            .map_err(|e| format!("invalid JSON: {}", e))
    }

    fn render_flag(&self) -> String {
        // Serializing a value that came out of serde_json cannot fail for
        // well-formed types; fall back to an empty document otherwise.
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_bool_literals() {
        for raw in ["1", "t", "T", "TRUE", "true", "True"] {
            assert!(bool::parse_flag(raw).unwrap());
        }
        for raw in ["0", "f", "F", "FALSE", "false", "False"] {
            assert!(!bool::parse_flag(raw).unwrap());
        }
        assert!(bool::parse_flag("yes").is_err());
    }

    #[test]
    fn test_integers() {
        assert_eq!(i64::parse_flag("-42").unwrap(), -42);
        assert_eq!(u16::parse_flag("8080").unwrap(), 8080);
        assert!(u16::parse_flag("70000").is_err());
        assert!(i32::parse_flag("notanumber").is_err());
    }

    #[test]
    fn test_string_list() {
        assert_eq!(
            Vec::<String>::parse_flag("a, b ,c").unwrap(),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert!(Vec::<String>::parse_flag("").unwrap().is_empty());
        assert_eq!(vec!["x".to_string(), "y".to_string()].render_flag(), "x,y");
    }

    #[test]
    fn test_parse_durations() {
        assert_eq!(Duration::parse_flag("0").unwrap(), Duration::ZERO);
        assert_eq!(Duration::parse_flag("300ms").unwrap(), Duration::from_millis(300));
        assert_eq!(Duration::parse_flag("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(
            Duration::parse_flag("1h30m").unwrap(),
            Duration::from_secs(90 * 60)
        );
        assert_eq!(Duration::parse_flag("2us").unwrap(), Duration::from_micros(2));
        assert_eq!(Duration::parse_flag("7ns").unwrap(), Duration::from_nanos(7));
    }

    #[test]
    fn test_parse_duration_errors() {
        assert!(Duration::parse_flag("").is_err());
        assert!(Duration::parse_flag("10").is_err());
        assert!(Duration::parse_flag("10x").is_err());
        assert!(Duration::parse_flag("ms").is_err());
        assert!(Duration::parse_flag("1.2.3s").is_err());
    }

    #[test]
    fn test_parse_duration_fraction_overflow() {
        // The whole part fits in u128 nanoseconds; the fraction pushes it over.
        let err = Duration::parse_flag("340282366920938463463374607431768211.999us").unwrap_err();
        assert!(err.contains("overflows"), "{}", err);
    }

    #[test]
    fn test_render_durations() {
        assert_eq!(Duration::ZERO.render_flag(), "0s");
        assert_eq!(Duration::from_millis(300).render_flag(), "300ms");
        assert_eq!(Duration::from_millis(1500).render_flag(), "1.5s");
        assert_eq!(Duration::from_secs(90 * 60).render_flag(), "1h30m0s");
        assert_eq!(Duration::from_secs(61).render_flag(), "1m1s");
        assert_eq!(Duration::from_nanos(1_500).render_flag(), "1.5µs");
    }

    #[cfg(feature = "json")]
    #[test]
    fn test_json_value() {
        #[derive(Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Shape {
            name: String,
            sizes: Vec<u32>,
        }

        let parsed = Json::<Shape>::parse_flag(r#"{"name":"box","sizes":[1,2]}"#).unwrap();
        assert_eq!(parsed.name, "box");
        assert_eq!(parsed.sizes, vec![1, 2]);
        assert!(Json::<Shape>::parse_flag("{not json").is_err());

        let again = Json::<Shape>::parse_flag(&parsed.render_flag()).unwrap();
        assert_eq!(again, parsed);
    }

    proptest! {
        #[test]
        fn prop_duration_round_trip(nanos in 0u64..(1u64 << 50)) {
            let d = Duration::from_nanos(nanos);
            prop_assert_eq!(Duration::parse_flag(&d.render_flag()).unwrap(), d);
        }

        #[test]
        fn prop_i64_round_trip(v in any::<i64>()) {
            prop_assert_eq!(i64::parse_flag(&v.render_flag()).unwrap(), v);
        }

        #[test]
        fn prop_f64_round_trip(v in any::<f64>().prop_filter("finite", |v| v.is_finite())) {
            prop_assert_eq!(f64::parse_flag(&v.render_flag()).unwrap(), v);
        }

        #[test]
        fn prop_list_round_trip(items in proptest::collection::vec("[a-z0-9]{1,8}", 0..6)) {
            prop_assert_eq!(Vec::<String>::parse_flag(&items.render_flag()).unwrap(), items);
        }
    }
}
