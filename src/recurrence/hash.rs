//! `H`/`R` token expansion: string -> canonical cron-like string.
//!
//! Kept strictly separate from iteration (`super::next`) so the hash
//! arithmetic is testable without touching the `cron`/`rrule` crates.

use rand::Rng;
use regex::Regex;

use crate::error::RecurrenceError;

/// Inclusive `(begin, end)` range per field, in the spec's field order:
/// minute, hour, day-of-month, month, day-of-week, second.
pub const FIELD_RANGES: [(u32, u32); 6] = [
    (0, 59), // minute
    (0, 23), // hour
    (1, 31), // day-of-month
    (1, 12), // month
    (0, 6),  // day-of-week
    (0, 59), // second (appended)
];

fn crc32(name: &str) -> u32 {
    crc32fast::hash(name.as_bytes())
}

/// `((crc32(name) >> idx) mod (range_end - range_begin + 1)) + range_begin`, or
/// the same with a fresh random `u32` in place of `crc32(name)` for `R` tokens.
fn hash_do(name: &str, idx: u32, range_begin: u32, range_end: u32, random: bool) -> u32 {
    let crc = if random {
        rand::thread_rng().gen_range(0..=0xffff_ffffu32)
    } else {
        crc32(name)
    };
    ((crc >> idx) % (range_end - range_begin + 1)) + range_begin
}

/// Expand `@alias` shorthands into their six-field hash/random form.
fn expand_alias(expr: &str) -> &str {
    match expr {
        "@midnight" => "H H(0-2) * * * H",
        "@hourly" => "H * * * * H",
        "@daily" => "H H * * * H",
        "@weekly" => "H H * * H H",
        "@monthly" => "H H H * * H",
        "@yearly" | "@annually" => "H H H H * H",
        other => other,
    }
}

/// Expand a cron-like expression's `H`/`R` tokens into a concrete, six-field
/// expression in the spec's own field order (minute hour dom month dow second).
/// Five-field input gets a literal `0` appended as the second field (matching
/// the reference implementation, which never hashes a field the caller did
/// not write) rather than a hashed one; a five-field schedule therefore
/// always fires on the minute, not at some hashed second within it.
pub fn expand(expr: &str, name: &str) -> Result<String, RecurrenceError> {
    let expr = expand_alias(expr.trim());

    let mut fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() == 5 {
        fields.push("0");
    }
    if fields.len() != 6 {
        return Err(RecurrenceError::InvalidExpression(
            expr.to_string(),
            format!("expected 5 or 6 fields, found {}", fields.len()),
        ));
    }

    let sub_range = Regex::new(r"^(H|R)\((\d+)-(\d+)\)/(\d+)$").unwrap();
    let sub = Regex::new(r"^(H|R)\((\d+)-(\d+)\)$").unwrap();
    let step = Regex::new(r"^(H|R)/(\d+)$").unwrap();

    let mut expanded = Vec::with_capacity(6);
    for (idx, field) in fields.into_iter().enumerate() {
        let (range_begin, range_end) = FIELD_RANGES[idx];
        let out = if field == "H" || field == "R" {
            let random = field == "R";
            hash_do(name, idx as u32, range_begin, range_end, random).to_string()
        } else if let Some(caps) = sub_range.captures(field) {
            // H(lo-hi)/n -> hash over [field_begin, n], then offset by lo:
            // e.g. H(30-59)/10 -> 35-59/10.
            let random = &caps[1] == "R";
            let lo: u32 = caps[2].parse().unwrap();
            let hi: u32 = caps[3].parse().unwrap();
            let n: u32 = caps[4].parse().unwrap();
            let hashed = hash_do(name, idx as u32, range_begin, n, random) + lo;
            format!("{}-{}/{}", hashed, hi, n)
        } else if let Some(caps) = sub.captures(field) {
            let random = &caps[1] == "R";
            let lo: u32 = caps[2].parse().unwrap();
            let hi: u32 = caps[3].parse().unwrap();
            hash_do(name, idx as u32, lo, hi, random).to_string()
        } else if let Some(caps) = step.captures(field) {
            // H/n -> hash over [field_begin, n], stepped up to the field's
            // own end: e.g. H/15 -> 7-59/15.
            let random = &caps[1] == "R";
            let n: u32 = caps[2].parse().unwrap();
            let hashed = hash_do(name, idx as u32, range_begin, n, random);
            format!("{}-{}/{}", hashed, range_end, n)
        } else {
            field.to_string()
        };
        expanded.push(out);
    }

    Ok(expanded.join(" "))
}

/// Sub-second offset added to the base instant so co-scheduled jobs don't
/// fire in perfect lock-step: `crc32(name) / 2^32` seconds.
pub fn sub_second_offset(name: &str) -> f64 {
    f64::from(crc32(name)) / f64::from(u32::MAX)
}
