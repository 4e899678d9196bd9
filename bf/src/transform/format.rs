//! Target field formatting
//!
//! Turns a transformed value into the text the loader expects for the field's
//! declared format: decimal rescaling, implied decimal points, sign placement,
//! date re-rendering and length enforcement. Fixed-width padding is applied
//! separately when the data file is written.

use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

use crate::domain::{DataType, FieldFormat, SignConvention};

/// Formatting failure for one value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("'{0}' is not a number")]
    InvalidNumber(String),

    #[error("'{0}' has a fractional part but the field is an integer")]
    FractionalInteger(String),

    #[error("'{value}' does not match date format {format}")]
    InvalidDate { value: String, format: String },

    #[error("'{0}' is negative but the field is unsigned")]
    Negative(String),

    #[error("value of length {actual} exceeds field length {max}")]
    TooLong { actual: usize, max: u32 },
}

/// Format a value for its target field
///
/// Blank values stay blank; the loader treats them as null.
pub fn format_value(value: &str, format: &FieldFormat) -> Result<String, FormatError> {
    if value.trim().is_empty() && format.data_type != DataType::Char {
        return Ok(String::new());
    }

    let rendered = match format.data_type {
        DataType::Char => value.to_string(),
        DataType::Integer => {
            let number = parse_number(value)?;
            if !number.fract().is_zero() {
                return Err(FormatError::FractionalInteger(value.to_string()));
            }
            apply_sign(&number.trunc().abs().normalize().to_string(), number, format.sign, value)?
        }
        DataType::Decimal => {
            let mut number =
                parse_number(value)?.round_dp_with_strategy(format.scale, RoundingStrategy::MidpointAwayFromZero);
            number.rescale(format.scale);
            let mut digits = number.abs().to_string();
            if format.implied_decimal {
                digits.retain(|c| c != '.');
            }
            apply_sign(&digits, number, format.sign, value)?
        }
        DataType::Date => {
            let date = parse_date(value.trim(), format.input_date_format())?;
            date.format(format.output_date_format()).to_string()
        }
    };

    if let Some(max) = format.length {
        let actual = rendered.chars().count();
        if actual > max as usize {
            return Err(FormatError::TooLong { actual, max });
        }
    }
    Ok(rendered)
}

fn parse_number(value: &str) -> Result<Decimal, FormatError> {
    let trimmed = value.trim();
    // accept trailing-sign input such as `123.45-`
    let parsed = match trimmed.strip_suffix('-') {
        Some(body) if !body.is_empty() && !body.starts_with('-') => Decimal::from_str(body).map(|d| -d),
        _ => Decimal::from_str(trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };
    parsed.map_err(|_| FormatError::InvalidNumber(value.to_string()))
}

fn parse_date(value: &str, format: &str) -> Result<NaiveDate, FormatError> {
    NaiveDate::parse_from_str(value, format)
        .or_else(|_| NaiveDateTime::parse_from_str(value, format).map(|dt| dt.date()))
        .map_err(|_| FormatError::InvalidDate {
            value: value.to_string(),
            format: format.to_string(),
        })
}

fn apply_sign(digits: &str, number: Decimal, sign: SignConvention, raw: &str) -> Result<String, FormatError> {
    let negative = number.is_sign_negative() && !number.is_zero();
    if !negative {
        return Ok(digits.to_string());
    }
    match sign {
        SignConvention::Leading => Ok(format!("-{}", digits)),
        SignConvention::Trailing => Ok(format!("{}-", digits)),
        SignConvention::None => Err(FormatError::Negative(raw.to_string())),
    }
}

/// Pad a formatted value to its fixed width
///
/// Text is right-padded with spaces; numbers are left-padded with zeros with
/// the sign kept in place. Blank numbers are padded with spaces.
pub fn pad_fixed(value: &str, format: &FieldFormat) -> String {
    let width = format.effective_length() as usize;
    let len = value.chars().count();
    if len >= width {
        return value.to_string();
    }
    let fill = width - len;

    if !format.data_type.is_numeric() || value.is_empty() {
        return format!("{}{}", value, " ".repeat(fill));
    }
    if let Some(body) = value.strip_prefix('-') {
        format!("-{}{}", "0".repeat(fill), body)
    } else {
        format!("{}{}", "0".repeat(fill), value)
    }
}
