//! Field-level checks
//!
//! Pure functions of a single value. Each returns `Err(message)` on failure.
//! Blank handling happens in the engine; these assume a non-blank value.

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::NaiveDate;
use chrono::format::{Item, StrftimeItems};
use regex::Regex;
use rust_decimal::Decimal;

use crate::domain::ValueType;

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9\-]*[A-Za-z0-9])?)*\.[A-Za-z]{2,}$")
        .expect("valid email regex")
});

static SSN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{3}-\d{2}-\d{4}|\d{9})$").expect("valid ssn regex"));

static INTEGER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?\d+$").expect("valid integer regex"));

pub fn length(value: &str, min: Option<usize>, max: Option<usize>) -> Result<(), String> {
    let len = value.chars().count();
    if let Some(min) = min.filter(|min| len < *min) {
        return Err(format!("length {} is below minimum {}", len, min));
    }
    if let Some(max) = max.filter(|max| len > *max) {
        return Err(format!("length {} exceeds maximum {}", len, max));
    }
    Ok(())
}

pub fn data_type(value: &str, value_type: ValueType, format: Option<&str>) -> Result<(), String> {
    let ok = match value_type {
        ValueType::Integer => INTEGER.is_match(value.trim()),
        ValueType::Decimal => Decimal::from_str(value.trim()).is_ok(),
        ValueType::Boolean => matches!(
            value.trim().to_lowercase().as_str(),
            "true" | "false" | "t" | "f" | "yes" | "no" | "y" | "n" | "1" | "0"
        ),
        ValueType::Date => return date_format(value, format.unwrap_or("%Y-%m-%d")),
        ValueType::Alpha => value.chars().all(char::is_alphabetic),
        ValueType::Alphanumeric => value.chars().all(char::is_alphanumeric),
    };
    if ok {
        Ok(())
    } else {
        Err(format!("'{}' is not a valid {}", value, format!("{:?}", value_type).to_lowercase()))
    }
}

pub fn pattern(value: &str, regex: &Regex) -> Result<(), String> {
    if regex.is_match(value) {
        Ok(())
    } else {
        Err(format!("'{}' does not match {}", value, regex.as_str()))
    }
}

pub fn email(value: &str) -> Result<(), String> {
    if EMAIL.is_match(value.trim()) {
        Ok(())
    } else {
        Err(format!("'{}' is not a valid email address", value))
    }
}

/// 7-15 digits once `+ ( ) - .` and spaces are stripped
pub fn phone(value: &str) -> Result<(), String> {
    let mut digits = 0;
    for c in value.chars() {
        match c {
            '0'..='9' => digits += 1,
            '+' | '(' | ')' | '-' | '.' | ' ' => {}
            _ => return Err(format!("'{}' contains invalid phone characters", value)),
        }
    }
    if (7..=15).contains(&digits) {
        Ok(())
    } else {
        Err(format!("'{}' has {} digits, expected 7 to 15", value, digits))
    }
}

pub fn ssn(value: &str) -> Result<(), String> {
    let invalid = || Err(format!("'{}' is not a valid SSN", value));
    let trimmed = value.trim();
    if !SSN.is_match(trimmed) {
        return invalid();
    }
    let digits = trimmed.replace('-', "");
    let (area, group, serial) = (&digits[..3], &digits[3..5], &digits[5..]);
    if area == "000" || area == "666" || area.starts_with('9') || group == "00" || serial == "0000" {
        return invalid();
    }
    Ok(())
}

pub fn numeric(value: &str, precision: Option<u32>, scale: Option<u32>, allow_negative: bool) -> Result<(), String> {
    let trimmed = value.trim();
    let number = Decimal::from_str(trimmed).map_err(|_| format!("'{}' is not numeric", value))?;
    if !allow_negative && number.is_sign_negative() && !number.is_zero() {
        return Err(format!("'{}' is negative", value));
    }

    let unsigned = trimmed.trim_start_matches(['+', '-']);
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
    let int_digits = int_part.trim_start_matches('0').len() as u32;
    let frac_digits = frac_part.len() as u32;

    if let Some(scale) = scale.filter(|s| frac_digits > *s) {
        return Err(format!("'{}' has {} decimal places, maximum {}", value, frac_digits, scale));
    }
    if let Some(precision) = precision {
        let allowed_int = precision.saturating_sub(scale.unwrap_or(0));
        if int_digits + frac_digits > precision || int_digits > allowed_int {
            return Err(format!("'{}' exceeds precision {}", value, precision));
        }
    }
    Ok(())
}

pub fn date_format(value: &str, format: &str) -> Result<(), String> {
    NaiveDate::parse_from_str(value.trim(), format)
        .map(|_| ())
        .map_err(|_| format!("'{}' does not match date format {}", value, format))
}

/// Whether a chrono format string is well formed
pub fn is_valid_date_format(format: &str) -> bool {
    !StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
}

pub fn range(value: &str, min: Option<Decimal>, max: Option<Decimal>) -> Result<(), String> {
    let number = Decimal::from_str(value.trim()).map_err(|_| format!("'{}' is not numeric", value))?;
    if let Some(min) = min.filter(|min| number < *min) {
        return Err(format!("{} is below minimum {}", number, min));
    }
    if let Some(max) = max.filter(|max| number > *max) {
        return Err(format!("{} exceeds maximum {}", number, max));
    }
    Ok(())
}

pub fn account_number(value: &str, min_length: usize, max_length: usize, luhn: bool) -> Result<(), String> {
    let digits: String = value.chars().filter(|c| *c != ' ' && *c != '-').collect();
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!("'{}' must contain only digits", value));
    }
    if digits.len() < min_length || digits.len() > max_length {
        return Err(format!(
            "'{}' has {} digits, expected {} to {}",
            value,
            digits.len(),
            min_length,
            max_length
        ));
    }
    if luhn && !luhn_valid(&digits) {
        return Err(format!("'{}' fails the Luhn check", value));
    }
    Ok(())
}

fn luhn_valid(digits: &str) -> bool {
    let sum: u32 = digits
        .chars()
        .rev()
        .filter_map(|c| c.to_digit(10))
        .enumerate()
        .map(|(i, d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}
