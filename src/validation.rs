// Input validation for user-supplied names and identifiers

use once_cell::sync::Lazy;
use regex::Regex;

static VERSION_UID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^V\d{10}$").unwrap());

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9.:@/_+-]{1,255}$").unwrap());

static LABEL_VALUE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-zA-Z0-9.:@/_+-]{0,255}$").unwrap());

/// A version UID is the letter `V` followed by exactly ten decimal digits.
pub fn is_version_uid(uid: &str) -> bool {
    VERSION_UID_RE.is_match(uid)
}

pub fn is_volume_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

pub fn is_snapshot_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

pub fn is_label_name(name: &str) -> bool {
    NAME_RE.is_match(name)
}

/// Label values may be empty, names may not.
pub fn is_label_value(value: &str) -> bool {
    LABEL_VALUE_RE.is_match(value)
}
