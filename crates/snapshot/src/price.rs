use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const CURRENCY_CODES: &[&str] = &[
    "USD", "EUR", "GBP", "INR", "JPY", "CAD", "AUD", "CNY", "AED", "SGD",
];

// Longer symbols first so `US$` is not read as a bare `$`.
const CURRENCY_SYMBOLS: &[(&str, &str)] = &[
    ("US$", "USD"),
    ("C$", "CAD"),
    ("A$", "AUD"),
    ("S$", "SGD"),
    ("₹", "INR"),
    ("€", "EUR"),
    ("£", "GBP"),
    ("¥", "JPY"),
    ("$", "USD"),
];

/// A price in canonical form: hundredths of the currency unit plus an ISO code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Price {
    pub minor: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

impl Price {
    pub fn new(minor: i64, currency: Option<&str>) -> Self {
        Self {
            minor,
            currency: currency.map(str::to_ascii_uppercase),
        }
    }

    /// Same amount, with currencies that agree or are unknown on either side.
    pub fn same_amount(&self, other: &Price) -> bool {
        self.minor == other.minor
            && match (&self.currency, &other.currency) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.minor / 100, self.minor % 100)?;
        if let Some(currency) = &self.currency {
            write!(f, " {currency}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PriceParseError {
    #[error("price text is empty")]
    Empty,
    #[error("no digits in price text `{0}`")]
    NoDigits(String),
    #[error("price `{0}` is out of range")]
    OutOfRange(String),
}

/// Normalizes a displayed price such as `₹1,299`, `$19.99` or `1.234,56 €`.
///
/// The first number in `text` is used. When both `.` and `,` appear, the later
/// one is the decimal separator. A lone separator followed by exactly three
/// digits is a thousands separator. Fractions beyond two digits are rounded
/// half up. `default_currency` applies when the text names no currency.
pub fn parse_price(text: &str, default_currency: Option<&str>) -> Result<Price, PriceParseError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(PriceParseError::Empty);
    }
    let number = first_number(text).ok_or_else(|| PriceParseError::NoDigits(text.to_string()))?;
    let minor = to_minor_units(number).ok_or_else(|| PriceParseError::OutOfRange(text.to_string()))?;
    let currency = detect_currency(text).or(default_currency);
    Ok(Price::new(minor, currency))
}

fn first_number(text: &str) -> Option<&str> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let mut end = start;
    for (idx, ch) in text[start..].char_indices() {
        match ch {
            '0'..='9' => end = start + idx + 1,
            '.' | ',' | '\'' => {}
            _ => break,
        }
    }
    Some(&text[start..end])
}

fn decimal_separator(number: &str) -> Option<usize> {
    match (number.rfind('.'), number.rfind(',')) {
        (Some(dot), Some(comma)) => Some(dot.max(comma)),
        (Some(pos), None) | (None, Some(pos)) => {
            let sep = number.as_bytes()[pos];
            let occurrences = number.bytes().filter(|b| *b == sep).count();
            let trailing = number.len() - pos - 1;
            let grouping = occurrences > 1 || (trailing == 3 && !number.starts_with('0'));
            (!grouping).then_some(pos)
        }
        (None, None) => None,
    }
}

fn to_minor_units(number: &str) -> Option<i64> {
    let (whole, fraction) = match decimal_separator(number) {
        Some(pos) => (&number[..pos], &number[pos + 1..]),
        None => (number, ""),
    };

    let mut units: i64 = 0;
    for digit in whole.bytes().filter(u8::is_ascii_digit) {
        units = units.checked_mul(10)?.checked_add(i64::from(digit - b'0'))?;
    }

    let digits: Vec<i64> = fraction
        .bytes()
        .filter(u8::is_ascii_digit)
        .map(|d| i64::from(d - b'0'))
        .collect();
    let tenths = digits.first().copied().unwrap_or(0);
    let hundredths = digits.get(1).copied().unwrap_or(0);
    let round_up = digits.get(2).is_some_and(|d| *d >= 5);

    units
        .checked_mul(100)?
        .checked_add(tenths * 10 + hundredths + i64::from(round_up))
}

fn detect_currency(text: &str) -> Option<&'static str> {
    for code in CURRENCY_CODES {
        if contains_token(text, code) {
            return Some(code);
        }
    }
    if contains_token(text, "Rs") || contains_token(text, "Rs.") {
        return Some("INR");
    }
    CURRENCY_SYMBOLS
        .iter()
        .find(|(symbol, _)| text.contains(symbol))
        .map(|(_, code)| *code)
}

fn contains_token(text: &str, token: &str) -> bool {
    text.match_indices(token).any(|(idx, _)| {
        let before = text[..idx].chars().next_back();
        let after = text[idx + token.len()..].chars().next();
        !before.is_some_and(char::is_alphabetic) && !after.is_some_and(char::is_alphabetic)
    })
}
