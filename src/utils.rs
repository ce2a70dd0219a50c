//! Utility functions for ids, money formatting and idempotency keys

use uuid7::uuid7;

pub const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Currencies without minor units. Every other currency is treated as having two.
const ZERO_DECIMAL_CURRENCIES: [&str; 8] = ["JPY", "KRW", "VND", "CLP", "ISK", "UGX", "XAF", "XOF"];

// numeric string id taken from the tail of a uuid7, where the per-millisecond
// counter and the random bits live
pub fn generate_id() -> String {
    let uuid = uuid7();
    let bytes = uuid.as_bytes();
    let mut tail = [0u8; 8];
    tail.copy_from_slice(&bytes[8..]);
    let id = u64::from_be_bytes(tail) & (i64::MAX as u64);
    id.to_string()
}

/// Placeholder account id for a login the client has no account for yet.
/// Derived from the login so repeated requests to the same address agree.
pub fn optimistic_account_id(login: &str) -> i64 {
    let digest = sha256::digest(login.trim().to_lowercase());
    // 15 hex digits always fit in a positive i64
    i64::from_str_radix(&digest[..15], 16).unwrap_or_default()
}

pub fn currency_decimals(currency: &str) -> u32 {
    if ZERO_DECIMAL_CURRENCIES.contains(&currency.to_ascii_uppercase().as_str()) {
        0
    } else {
        2
    }
}

fn currency_symbol(currency: &str) -> Option<&'static str> {
    match currency {
        "USD" => Some("$"),
        "EUR" => Some("€"),
        "GBP" => Some("£"),
        "JPY" => Some("¥"),
        _ => None,
    }
}

/// Renders an amount held in cents (always two implied decimals) for display,
/// e.g. `$12.34` or `CAD 12.34`.
pub fn format_amount(amount_in_cents: i64, currency: &str) -> String {
    let sign = if amount_in_cents < 0 { "-" } else { "" };
    let abs = amount_in_cents.unsigned_abs();
    let number = if currency_decimals(currency) == 0 {
        format!("{}", (abs + 50) / 100)
    } else {
        format!("{}.{:02}", abs / 100, abs % 100)
    };
    match currency_symbol(currency) {
        Some(symbol) => format!("{sign}{symbol}{number}"),
        None => format!("{sign}{currency} {number}"),
    }
}

/// Stable key for a write so that retries of the same optimistic ids collapse.
pub fn idempotency_key(command: &str, correlation: &serde_json::Value) -> String {
    sha256::digest(format!("{command}:{correlation}"))
}
