// Domain value types: version UIDs, block UIDs, statuses, checksums, timestamps

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Timelike, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

use crate::error::CatalogError;
use crate::validation;
use crate::Result;

/// Maximum length of a block checksum in bytes (raw, not hex).
pub const MAX_CHECKSUM_LENGTH: usize = 64;

/// Lifecycle state of a version.
///
/// `Incomplete` versions have never been fully written; `Invalid` marks a
/// version whose backing data is known to be corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VersionStatus {
    Incomplete = 1,
    Valid = 2,
    Invalid = 3,
}

impl VersionStatus {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            1 => Some(VersionStatus::Incomplete),
            2 => Some(VersionStatus::Valid),
            3 => Some(VersionStatus::Invalid),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Incomplete => "incomplete",
            VersionStatus::Valid => "valid",
            VersionStatus::Invalid => "invalid",
        }
    }

    pub fn is_valid(&self) -> bool {
        *self == VersionStatus::Valid
    }

    pub fn is_scrubbable(&self) -> bool {
        *self == VersionStatus::Valid
    }

    pub fn is_deep_scrubbable(&self) -> bool {
        *self == VersionStatus::Valid || *self == VersionStatus::Invalid
    }

    pub fn is_removable(&self) -> bool {
        *self != VersionStatus::Incomplete
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VersionStatus {
    type Err = CatalogError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "incomplete" => Ok(VersionStatus::Incomplete),
            "valid" => Ok(VersionStatus::Valid),
            "invalid" => Ok(VersionStatus::Invalid),
            _ => Err(CatalogError::InputData(format!(
                "Version status {} is invalid.",
                s
            ))),
        }
    }
}

impl ToSql for VersionStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(*self as i64))
    }
}

impl FromSql for VersionStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = i64::column_result(value)?;
        VersionStatus::from_i64(raw).ok_or(FromSqlError::OutOfRange(raw))
    }
}

/// Externally visible version identifier, the letter `V` followed by exactly
/// ten decimal digits.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionUid(String);

impl VersionUid {
    pub const STORAGE_PREFIX: &'static str = "versions/";

    pub fn new(uid: &str) -> Result<Self> {
        if !validation::is_version_uid(uid) {
            return Err(CatalogError::InputData(format!(
                "Version name {} is invalid.",
                uid
            )));
        }
        Ok(VersionUid(uid.to_string()))
    }

    pub fn from_number(number: u64) -> Result<Self> {
        Self::new(&format!("V{:010}", number))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key under which this version's metadata lives in object storage,
    /// relative to [`Self::STORAGE_PREFIX`].
    pub fn storage_key(&self) -> String {
        self.0.clone()
    }

    pub fn from_storage_key(key: &str) -> Result<Self> {
        Self::new(key)
    }
}

impl fmt::Display for VersionUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ToSql for VersionUid {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0.as_str()))
    }
}

impl FromSql for VersionUid {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = <String as FromSql>::column_result(value)?;
        VersionUid::new(&raw).map_err(|error| FromSqlError::Other(Box::new(error)))
    }
}

/// Content-addressed identifier of a stored block payload, a pair of 64-bit
/// integers. A sparse slot carries no uid and is modelled as
/// `Option<BlockUid>::None` throughout the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockUid {
    pub left: u64,
    pub right: u64,
}

impl BlockUid {
    pub const STORAGE_PREFIX: &'static str = "blocks/";

    pub fn new(left: u64, right: u64) -> Self {
        BlockUid { left, right }
    }

    /// Key under which this block's payload lives in object storage,
    /// relative to [`Self::STORAGE_PREFIX`]. Always 33 characters.
    pub fn storage_key(&self) -> String {
        format!("{:016x}-{:016x}", self.left, self.right)
    }

    pub fn from_storage_key(key: &str) -> Result<Self> {
        if key.len() != 33 || !key.is_ascii() || key.as_bytes()[16] != b'-' {
            return Err(CatalogError::InputData(format!(
                "Object key {} has an invalid length, expected exactly 33 characters.",
                key
            )));
        }
        let left = u64::from_str_radix(&key[0..16], 16).map_err(|_| {
            CatalogError::InputData(format!("Object key {} is not valid hex.", key))
        })?;
        let right = u64::from_str_radix(&key[17..33], 16).map_err(|_| {
            CatalogError::InputData(format!("Object key {} is not valid hex.", key))
        })?;
        Ok(BlockUid::new(left, right))
    }
}

impl fmt::Display for BlockUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}-{:x}", self.left, self.right)
    }
}

/// Decode a transport-form (lowercase hex) checksum into its persisted form.
pub fn checksum_to_bytes(checksum: &str) -> Result<Vec<u8>> {
    let bytes = hex::decode(checksum)
        .map_err(|_| CatalogError::InputData(format!("Checksum {} is not valid hex.", checksum)))?;
    if bytes.len() > MAX_CHECKSUM_LENGTH {
        return Err(CatalogError::InputData(format!(
            "Checksum {} exceeds the maximum length of {} bytes.",
            checksum, MAX_CHECKSUM_LENGTH
        )));
    }
    Ok(bytes)
}

/// Current wall time as a UTC-naive timestamp, truncated to microsecond
/// precision to match the export date format. All catalog timestamps are
/// stored this way.
pub fn utc_now() -> NaiveDateTime {
    let now = Utc::now().naive_utc();
    now.with_nanosecond(now.nanosecond() / 1_000 * 1_000)
        .unwrap_or(now)
}

/// Parse a user-supplied point in time into a UTC-naive timestamp.
///
/// Accepted forms: RFC 3339 with an offset (converted to UTC and stripped),
/// a naive ISO timestamp with optional fraction and optional trailing `Z`
/// (assumed UTC), and a bare date (midnight).
pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime> {
    if let Ok(aware) = DateTime::parse_from_rfc3339(value) {
        return Ok(aware.with_timezone(&Utc).naive_utc());
    }
    let naive = value.strip_suffix('Z').unwrap_or(value);
    if let Ok(date_time) = NaiveDateTime::parse_from_str(naive, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(date_time);
    }
    if let Ok(date_time) = NaiveDateTime::parse_from_str(naive, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(date_time);
    }
    if let Ok(date) = NaiveDate::parse_from_str(naive, "%Y-%m-%d") {
        return Ok(date.and_hms_opt(0, 0, 0).unwrap());
    }
    Err(CatalogError::InputData(format!(
        "Invalid date and time specification: {}.",
        value
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_uid() -> Result<()> {
        let uid = VersionUid::new("V0000000001")?;
        assert_eq!(uid.as_str(), "V0000000001");
        assert_eq!(uid.storage_key(), "V0000000001");
        assert_eq!(VersionUid::from_number(42)?.as_str(), "V0000000042");
        assert!(VersionUid::new("V1").is_err());
        assert!(VersionUid::from_number(10_000_000_000).is_err());
        Ok(())
    }

    #[test]
    fn test_block_uid_storage_key() -> Result<()> {
        let uid = BlockUid::new(1, 2);
        assert_eq!(
            uid.storage_key(),
            "0000000000000001-0000000000000002"
        );
        assert_eq!(uid.storage_key().len(), 33);
        assert_eq!(BlockUid::from_storage_key(&uid.storage_key())?, uid);
        Ok(())
    }

    #[test]
    fn test_block_uid_storage_key_rejects_malformed() {
        assert!(BlockUid::from_storage_key("0001-0002").is_err());
        assert!(BlockUid::from_storage_key(
            "000000000000000100000000000000002"
        )
        .is_err());
        assert!(BlockUid::from_storage_key(
            "000000000000000g-0000000000000002"
        )
        .is_err());
    }

    #[test]
    fn test_block_uid_ordering() {
        assert!(BlockUid::new(1, 5) < BlockUid::new(2, 0));
        assert!(BlockUid::new(1, 1) < BlockUid::new(1, 2));
        assert_eq!(BlockUid::new(3, 4), BlockUid::new(3, 4));
    }

    #[test]
    fn test_version_status() -> Result<()> {
        assert_eq!("valid".parse::<VersionStatus>()?, VersionStatus::Valid);
        assert_eq!(VersionStatus::Incomplete.to_string(), "incomplete");
        assert!(VersionStatus::from_i64(4).is_none());
        assert!(!VersionStatus::Incomplete.is_removable());
        assert!(VersionStatus::Invalid.is_deep_scrubbable());
        assert!(!VersionStatus::Invalid.is_scrubbable());
        assert!("complete".parse::<VersionStatus>().is_err());
        Ok(())
    }

    #[test]
    fn test_checksum_codec() -> Result<()> {
        assert_eq!(checksum_to_bytes("aabb")?, vec![0xaa, 0xbb]);
        assert!(checksum_to_bytes("zz").is_err());
        assert!(checksum_to_bytes(&"ab".repeat(65)).is_err());
        Ok(())
    }

    #[test]
    fn test_parse_timestamp() -> Result<()> {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(3, 4, 5)
            .unwrap();
        assert_eq!(parse_timestamp("2024-01-02T03:04:05")?, expected);
        assert_eq!(parse_timestamp("2024-01-02T03:04:05Z")?, expected);
        assert_eq!(parse_timestamp("2024-01-02 03:04:05")?, expected);
        // Offsets are converted to UTC and stripped.
        assert_eq!(parse_timestamp("2024-01-02T04:04:05+01:00")?, expected);
        assert_eq!(
            parse_timestamp("2024-01-02")?,
            NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap()
        );
        assert!(parse_timestamp("yesterday").is_err());
        Ok(())
    }
}
