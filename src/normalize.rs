//! Field normalizers for loosely typed source cells.
//!
//! Every function here is total: bad input becomes `None` (or `false` for
//! booleans), never a panic. The identifier canonicalizers at the bottom are the
//! only place identifiers are cleaned up; parsers and natural keys both go
//! through them.

use chrono::{Days, NaiveDate};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::str::FromStr;

use crate::constants::{
    SERIAL_DATE_EPOCH, SERIAL_DATE_MAX, SERIAL_DATE_MIN, TWO_DIGIT_YEAR_PIVOT,
};
use crate::raw_row::Cell;

pub fn normalize_text(cell: Option<&Cell>) -> Option<String> {
    let cell = cell?;
    match cell {
        Cell::Empty => None,
        Cell::Text(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Cell::Number(value) if value.is_finite() => Some(cell.display_value()),
        Cell::Number(_) => None,
        Cell::Bool(value) => Some(value.to_string()),
    }
}

/// Parses amounts like `$1,234.50`, `(12.00)`, `-3`, `USD 7.25`.
/// Parenthesized amounts are negative.
pub fn normalize_currency(cell: Option<&Cell>) -> Option<Decimal> {
    match cell? {
        Cell::Number(value) if value.is_finite() => Decimal::from_f64(*value),
        Cell::Text(text) => parse_currency_text(text),
        _ => None,
    }
}

fn parse_currency_text(raw: &str) -> Option<Decimal> {
    let mut text = raw.trim();
    let mut negative = false;
    if text.len() >= 2 && text.starts_with('(') && text.ends_with(')') {
        negative = true;
        text = &text[1..text.len() - 1];
    }
    let text = text
        .trim()
        .trim_start_matches("USD")
        .trim_end_matches("USD")
        .trim();

    let mut cleaned = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '0'..='9' | '.' => cleaned.push(c),
            '-' => negative = !negative,
            ',' | '$' | '€' | '£' | ' ' | '\u{a0}' => {}
            _ => return None,
        }
    }
    if cleaned.is_empty() || cleaned == "." {
        return None;
    }
    let value = Decimal::from_str(&cleaned).ok()?;
    Some(if negative { -value } else { value })
}

/// Parses textual dates (`M/D/YYYY`, `M/D/YY`, ISO, `YYYYMMDD`) and spreadsheet
/// serial day counts into a calendar date.
pub fn normalize_date(cell: Option<&Cell>) -> Option<NaiveDate> {
    match cell? {
        Cell::Number(value) => date_from_number(*value),
        Cell::Text(text) => parse_date_text(text),
        _ => None,
    }
}

/// Canonical string form used for storage.
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn date_from_number(value: f64) -> Option<NaiveDate> {
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    let whole = value.trunc();
    if (10_000_000.0..=99_999_999.0).contains(&whole) && value.fract() == 0.0 {
        return parse_yyyymmdd(&format!("{}", whole as i64));
    }
    serial_to_date(whole as i64)
}

fn serial_to_date(serial: i64) -> Option<NaiveDate> {
    if !(SERIAL_DATE_MIN..=SERIAL_DATE_MAX).contains(&serial) {
        return None;
    }
    let (y, m, d) = SERIAL_DATE_EPOCH;
    NaiveDate::from_ymd_opt(y, m, d)?.checked_add_days(Days::new(serial as u64))
}

fn parse_date_text(raw: &str) -> Option<NaiveDate> {
    let text = raw.trim();
    let first_token = text.split_whitespace().next()?;
    // ISO datetimes: 2024-01-05T10:00:00
    let token = match first_token.find('T') {
        Some(idx) if idx == 10 => &first_token[..idx],
        _ => first_token,
    };

    if token.contains('/') {
        return parse_slash_date(token);
    }
    if token.contains('-') {
        return NaiveDate::parse_from_str(token, "%Y-%m-%d").ok();
    }
    if token.chars().all(|c| c.is_ascii_digit()) {
        if token.len() == 8 {
            return parse_yyyymmdd(token);
        }
        return token.parse::<i64>().ok().and_then(serial_to_date);
    }
    // "45292.0" style serials exported as text.
    token.parse::<f64>().ok().and_then(date_from_number)
}

fn parse_yyyymmdd(token: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(token, "%Y%m%d").ok()
}

fn parse_slash_date(token: &str) -> Option<NaiveDate> {
    let mut parts = token.split('/');
    let first: u32 = parts.next()?.trim().parse().ok()?;
    let second: u32 = parts.next()?.trim().parse().ok()?;
    let year_part = parts.next()?.trim();
    if parts.next().is_some() {
        return None;
    }
    let year: i32 = match year_part.len() {
        4 => year_part.parse().ok()?,
        2 => {
            let yy: i32 = year_part.parse().ok()?;
            if yy < TWO_DIGIT_YEAR_PIVOT {
                2000 + yy
            } else {
                1900 + yy
            }
        }
        _ => return None,
    };

    // US extracts: 05/01/2024 is May 1. Day-first only when the first component cannot be a month.
    let (month, day) = if first > 12 && second <= 12 {
        (second, first)
    } else {
        (first, second)
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

pub fn normalize_integer(cell: Option<&Cell>) -> Option<i64> {
    match cell? {
        Cell::Number(value) => integral(*value),
        Cell::Text(text) => {
            let compact: String = text
                .trim()
                .chars()
                .filter(|c| *c != ',' && !c.is_whitespace())
                .collect();
            if compact.is_empty() {
                return None;
            }
            compact
                .parse::<i64>()
                .ok()
                .or_else(|| compact.parse::<f64>().ok().and_then(integral))
        }
        _ => None,
    }
}

fn integral(value: f64) -> Option<i64> {
    (value.is_finite() && value.fract() == 0.0 && value.abs() < 9.0e15).then_some(value as i64)
}

/// `yes`, `true` and `1` (any case) are true; everything else, blanks
/// included, is false.
pub fn normalize_boolean(cell: Option<&Cell>) -> bool {
    match cell {
        Some(Cell::Bool(value)) => *value,
        Some(Cell::Number(value)) => *value == 1.0,
        Some(Cell::Text(text)) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "yes" | "true" | "1"
        ),
        _ => false,
    }
}

/// Digits-only form of a numeric identifier. Accepts spreadsheet artifacts such
/// as a trailing `.0` and separators (`-`, spaces); rejects anything else.
fn compact_digits(raw: &str) -> Option<String> {
    let mut compact: String = raw
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    if compact.ends_with(".0") {
        compact.truncate(compact.len().saturating_sub(2));
    }
    if compact.is_empty() || !compact.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(compact)
}

/// 11-digit NDC. Hyphenated 4-4-2, 5-3-2 and 5-4-1 codes are padded per segment;
/// unsegmented codes are left-padded with zeros.
pub fn canonical_ndc11(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let segments: Vec<&str> = trimmed.split('-').map(str::trim).collect();
    if segments.len() == 3 {
        let all_digits = segments
            .iter()
            .all(|s| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()));
        if !all_digits || segments[0].len() > 5 || segments[1].len() > 4 || segments[2].len() > 2
        {
            return None;
        }
        return Some(format!(
            "{:0>5}{:0>4}{:0>2}",
            segments[0], segments[1], segments[2]
        ));
    }

    let digits = compact_digits(trimmed)?;
    if digits.len() > 11 {
        return None;
    }
    Some(format!("{digits:0>11}"))
}

pub fn canonical_npi(raw: &str) -> Option<String> {
    compact_digits(raw).filter(|digits| digits.len() == 10)
}

/// NCPDP / NABP pharmacy number, 7 digits.
pub fn canonical_nabp(raw: &str) -> Option<String> {
    compact_digits(raw)
        .filter(|digits| digits.len() <= 7)
        .map(|digits| format!("{digits:0>7}"))
}

/// Pharmacy benefit BIN, 6 digits.
pub fn canonical_bin(raw: &str) -> Option<String> {
    compact_digits(raw)
        .filter(|digits| digits.len() <= 6)
        .map(|digits| format!("{digits:0>6}"))
}

/// Free-form plan codes (PCN, group): uppercase, no whitespace.
pub fn canonical_code(raw: &str) -> Option<String> {
    let code: String = raw
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();
    (!code.is_empty()).then_some(code)
}

pub fn canonical_zip(raw: &str) -> Option<String> {
    let head = raw.trim().split('-').next()?;
    let digits = compact_digits(head)?;
    match digits.len() {
        9 => Some(digits[..5].to_string()),
        1..=5 => Some(format!("{digits:0>5}")),
        _ => None,
    }
}

pub fn canonical_dea(raw: &str) -> Option<String> {
    let compact: String = raw
        .trim()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_uppercase();
    (compact.len() == 9).then_some(compact)
}

pub fn canonical_state(raw: &str) -> Option<String> {
    let state = raw.trim().to_ascii_uppercase();
    (state.len() == 2 && state.chars().all(|c| c.is_ascii_alphabetic())).then_some(state)
}

pub fn canonical_gender(raw: &str) -> Option<String> {
    let value = raw.trim().to_ascii_uppercase();
    match value.as_str() {
        "" => None,
        "M" | "MALE" => Some("M".to_string()),
        "F" | "FEMALE" => Some("F".to_string()),
        _ => Some("U".to_string()),
    }
}

/// Case- and whitespace-insensitive form of a free-text name.
pub fn canonical_name(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
