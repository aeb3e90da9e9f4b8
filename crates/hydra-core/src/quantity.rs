//! Resource quantity strings.
//!
//! Cluster resources are exchanged as quantity strings (`2000m`, `8Gi`, `2`).
//! Only the subset this service produces and aggregates is supported.

/// Format a CPU amount in millicores as a request string (`2000m`).
#[must_use]
pub fn milli(value: u64) -> String {
    format!("{value}m")
}

/// Format a memory amount in MiB as a request string (`8192Mi`).
#[must_use]
pub fn mebi(value: u64) -> String {
    format!("{value}Mi")
}

/// Canonical form of a millicore amount: whole cores without suffix.
#[must_use]
pub fn canonical_milli(value: u64) -> String {
    if value % 1000 == 0 {
        (value / 1000).to_string()
    } else {
        milli(value)
    }
}

/// Canonical form of a MiB amount using the largest exact binary suffix.
#[must_use]
pub fn canonical_mebi(value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut amount = value;
    for suffix in ["Mi", "Gi", "Ti"] {
        if amount % 1024 != 0 || suffix == "Ti" {
            return format!("{amount}{suffix}");
        }
        amount /= 1024;
    }
    format!("{amount}Ti")
}

/// Canonical form of a request string produced by [`milli`] or [`mebi`].
///
/// Other strings are returned unchanged.
#[must_use]
pub fn canonical(quantity: &str) -> String {
    if let Some(value) = quantity.strip_suffix("Mi").and_then(|n| n.parse().ok()) {
        return canonical_mebi(value);
    }
    if let Some(value) = quantity.strip_suffix('m').and_then(|n| n.parse().ok()) {
        return canonical_milli(value);
    }
    quantity.to_string()
}

/// Parse a quantity string into a whole count, rounding fractions up.
///
/// Accepts plain integers, milli values and the decimal/binary suffixes.
/// Returns `None` for anything else.
#[must_use]
pub fn parse_count(quantity: &str) -> Option<i64> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return None;
    }

    let split = quantity
        .find(|c: char| !(c.is_ascii_digit() || c == '-'))
        .unwrap_or(quantity.len());
    let (number, suffix) = quantity.split_at(split);
    let number: i64 = number.parse().ok()?;

    let scaled = match suffix {
        "" => number,
        "m" => (number + 999).div_euclid(1000),
        "k" => number.checked_mul(1_000)?,
        "M" => number.checked_mul(1_000_000)?,
        "G" => number.checked_mul(1_000_000_000)?,
        "Ki" => number.checked_mul(1 << 10)?,
        "Mi" => number.checked_mul(1 << 20)?,
        "Gi" => number.checked_mul(1 << 30)?,
        "Ti" => number.checked_mul(1 << 40)?,
        _ => return None,
    };
    Some(scaled)
}
