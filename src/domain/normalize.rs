//! Field normalizers
//!
//! Free-text values from the site ("24 500 ₼", "250 000 km", "2.0 L / 150 a.g. / Benzin")
//! are converted into typed values. Every function here is total: `None` in
//! gives `None` out, garbage gives whatever digits can be salvaged, and no
//! input can panic.

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref DIGIT_RUN: Regex = Regex::new(r"[0-9]+").unwrap();
    static ref DECIMAL_NUMBER: Regex = Regex::new(r"[0-9]+(?:[.,][0-9]+)?").unwrap();
    static ref DOTTED_DATE: Regex = Regex::new(r"([0-9]{1,2})\.([0-9]{1,2})\.([0-9]{4})").unwrap();
}

/// Keep every ASCII digit and parse the result
fn all_digits(text: Option<&str>) -> Option<i64> {
    let digits: String = text?.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Parse the first contiguous run of digits
fn first_digit_run(text: Option<&str>) -> Option<i64> {
    DIGIT_RUN.find(text?).and_then(|m| m.as_str().parse().ok())
}

/// `"24 500 ₼"` → `24500`
pub fn normalize_price(text: Option<&str>) -> Option<i64> {
    all_digits(text)
}

/// `"250 000 km"` → `250000`
pub fn normalize_mileage(text: Option<&str>) -> Option<i64> {
    all_digits(text)
}

/// `"150 a.g."` → `150`
pub fn normalize_engine_power(text: Option<&str>) -> Option<i32> {
    first_digit_run(text).and_then(|v| i32::try_from(v).ok())
}

/// `"2.0 L"` → `2.0`; a comma decimal separator is accepted
pub fn normalize_engine_volume(text: Option<&str>) -> Option<f64> {
    DECIMAL_NUMBER
        .find(text?)
        .and_then(|m| m.as_str().replace(',', ".").parse().ok())
}

/// First digit run as a small count (year, seats)
pub fn normalize_count(text: Option<&str>) -> Option<i32> {
    first_digit_run(text).and_then(|v| i32::try_from(v).ok())
}

/// `"Yeniləndi: 15.10.2026"` → 2026-10-15
pub fn normalize_date(text: Option<&str>) -> Option<NaiveDate> {
    let caps = DOTTED_DATE.captures(text?)?;
    let day = caps.get(1)?.as_str().parse().ok()?;
    let month = caps.get(2)?.as_str().parse().ok()?;
    let year = caps.get(3)?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// `"Bəli"` / `"Xeyr"` (and English variants) → bool
pub fn normalize_yes_no(text: Option<&str>) -> Option<bool> {
    let value = text?.trim().to_lowercase();
    match value.as_str() {
        "bəli" | "beli" | "yes" | "да" => Some(true),
        "xeyr" | "no" | "нет" => Some(false),
        _ => None,
    }
}

/// Collapse inner whitespace; blank text becomes `None`
pub fn clean_text(text: &str) -> Option<String> {
    let cleaned = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.is_empty() { None } else { Some(cleaned) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case("24 500 ₼", Some(24_500))]
    #[case("35,000 AZN", Some(35_000))]
    #[case("₼", None)]
    #[case("", None)]
    #[case("99999999999999999999999", None)]
    fn price_cases(#[case] input: &str, #[case] expected: Option<i64>) {
        assert_eq!(normalize_price(Some(input)), expected);
    }

    #[rstest]
    #[case("250 000 km", Some(250_000))]
    #[case("0 km", Some(0))]
    #[case("km", None)]
    fn mileage_cases(#[case] input: &str, #[case] expected: Option<i64>) {
        assert_eq!(normalize_mileage(Some(input)), expected);
    }

    #[rstest]
    #[case("150 a.g.", Some(150))]
    #[case("249 a.g. / Dizel", Some(249))]
    #[case("a.g.", None)]
    fn engine_power_cases(#[case] input: &str, #[case] expected: Option<i32>) {
        assert_eq!(normalize_engine_power(Some(input)), expected);
    }

    #[test]
    fn null_and_empty_inputs_give_none() {
        assert_eq!(normalize_price(None), None);
        assert_eq!(normalize_mileage(None), None);
        assert_eq!(normalize_engine_power(None), None);
        assert_eq!(normalize_price(Some("")), None);
        assert_eq!(normalize_mileage(Some("")), None);
        assert_eq!(normalize_engine_power(Some("")), None);
    }

    #[test]
    fn engine_volume_accepts_both_separators() {
        assert_eq!(normalize_engine_volume(Some("2.0 L")), Some(2.0));
        assert_eq!(normalize_engine_volume(Some("1,6 L")), Some(1.6));
        assert_eq!(normalize_engine_volume(Some("L")), None);
    }

    #[test]
    fn dates_are_found_inside_labels() {
        assert_eq!(
            normalize_date(Some("Yeniləndi: 15.10.2026")),
            NaiveDate::from_ymd_opt(2026, 10, 15)
        );
        assert_eq!(normalize_date(Some("31.02.2026")), None);
        assert_eq!(normalize_date(Some("bu gün")), None);
    }

    #[test]
    fn yes_no_flags() {
        assert_eq!(normalize_yes_no(Some("Bəli")), Some(true));
        assert_eq!(normalize_yes_no(Some(" Xeyr ")), Some(false));
        assert_eq!(normalize_yes_no(Some("bilinmir")), None);
    }

    #[test]
    fn clean_text_collapses_whitespace() {
        assert_eq!(clean_text("  Mercedes \n  E 220 "), Some("Mercedes E 220".to_string()));
        assert_eq!(clean_text(" \t\n"), None);
    }

    proptest! {
        #[test]
        fn normalizers_never_panic(s in "\\PC*") {
            let _ = normalize_price(Some(&s));
            let _ = normalize_mileage(Some(&s));
            let _ = normalize_engine_power(Some(&s));
            let _ = normalize_engine_volume(Some(&s));
            let _ = normalize_date(Some(&s));
            let _ = normalize_count(Some(&s));
        }

        #[test]
        fn price_ignores_decoration(n in 0i64..1_000_000_000, suffix in "[ a-zA-Z₼$]{0,6}") {
            let text = format!("{n}{suffix}");
            prop_assert_eq!(normalize_price(Some(&text)), Some(n));
        }
    }
}
