//! Identifiers, timestamps and cookie handling

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Timestamps
// ----------------------------------------------------------------------------

/// Milliseconds since the Unix epoch, as used in protocol sequence fields
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

// ----------------------------------------------------------------------------
// Message and Device Identifiers
// ----------------------------------------------------------------------------

/// Generate a message id: a random prefix in `0..1000` followed by the current
/// epoch milliseconds and the literal suffix `" 0"`.
pub fn generate_mid() -> String {
    let prefix: u32 = rand::thread_rng().gen_range(0..1000);
    format!("{}{} 0", prefix, now_millis())
}

/// Generate the per-send uuid field of a chat envelope
pub fn generate_uuid() -> String {
    format!("-{}1", now_millis())
}

/// Derive a device id for an account: an uppercase random UUID suffixed with
/// the account id.
pub fn generate_device_id(account_id: &str) -> String {
    let id = uuid::Uuid::new_v4().to_string().to_uppercase();
    format!("{}-{}", id, account_id)
}

/// Identity of the logged-in seller account for one process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub account_id: String,
    pub device_id: String,
}

impl SessionIdentity {
    /// Build an identity with a freshly generated device id
    pub fn for_account<T: Into<String>>(account_id: T) -> Self {
        let account_id = account_id.into();
        let device_id = generate_device_id(&account_id);
        Self {
            account_id,
            device_id,
        }
    }
}

// ----------------------------------------------------------------------------
// Cookies
// ----------------------------------------------------------------------------

/// Cookie name carrying the account id
pub const ACCOUNT_COOKIE: &str = "unb";

/// Parse a `k=v; k2=v2` cookie header into a map. Segments without `=` are skipped.
pub fn parse_cookies(raw: &str) -> BTreeMap<String, String> {
    raw.split(';')
        .filter_map(|pair| {
            let pair = pair.trim();
            let (name, value) = pair.split_once('=')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Extract the account id from a raw cookie string
pub fn account_id_from_cookies(raw: &str) -> Option<String> {
    parse_cookies(raw)
        .remove(ACCOUNT_COOKIE)
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mid_format() {
        let mid = generate_mid();
        assert!(mid.ends_with(" 0"));
        let digits = mid.trim_end_matches(" 0");
        assert!(digits.chars().all(|c| c.is_ascii_digit()));
        // epoch millis alone is 13 digits
        assert!(digits.len() >= 13);
    }

    #[test]
    fn test_uuid_format() {
        let uuid = generate_uuid();
        assert!(uuid.starts_with('-'));
        assert!(uuid.ends_with('1'));
    }

    #[test]
    fn test_device_id_carries_account() {
        let device = generate_device_id("2200687521");
        assert!(device.ends_with("-2200687521"));
        let prefix = device.trim_end_matches("-2200687521");
        assert_eq!(prefix, prefix.to_uppercase());
        assert_eq!(prefix.len(), 36);
    }

    #[test]
    fn test_parse_cookies() {
        let cookies = parse_cookies("cna=abc; unb=2200687521; _m_h5_tk=tk_1=2; broken");
        assert_eq!(cookies.get("cna").map(String::as_str), Some("abc"));
        assert_eq!(cookies.get("unb").map(String::as_str), Some("2200687521"));
        // only the first '=' separates name and value
        assert_eq!(cookies.get("_m_h5_tk").map(String::as_str), Some("tk_1=2"));
        assert!(!cookies.contains_key("broken"));
    }

    #[test]
    fn test_account_id_from_cookies() {
        assert_eq!(
            account_id_from_cookies("a=1; unb=42").as_deref(),
            Some("42")
        );
        assert_eq!(account_id_from_cookies("a=1"), None);
        assert_eq!(account_id_from_cookies("unb="), None);
    }
}
