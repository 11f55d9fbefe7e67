//! Encoding utilities, time stamps, and input validation.

use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine as _;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::{EsimError, Result, ResultExt as _};

// ---------------------------------------------------------------------------
// Base64
// ---------------------------------------------------------------------------

/// Standard alphabet, padding optional on decode.
const B64_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

pub fn b64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

/// Decode standard base64, accepting input with or without `=` padding.
pub fn b64_decode_lenient(s: &str) -> Result<Vec<u8>> {
    B64_LENIENT.decode(s.trim()).ctx_format("invalid base64")
}

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Fixed-width UTC timestamp (microsecond precision) so that stored values
/// sort lexicographically in time order.
const SORTABLE_TS: &[time::format_description::FormatItem<'static>] = time::macros::format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
);

pub fn now_utc_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub fn now_utc_sortable() -> String {
    OffsetDateTime::now_utc()
        .format(SORTABLE_TS)
        .unwrap_or_else(|_| "1970-01-01T00:00:00.000000Z".to_string())
}

pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

static ICCID_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"^[0-9]{18,22}$").unwrap());

/// Validate an ICCID / serial before it is used in a request path.
///
/// Returns the trimmed serial.
pub fn validate_iccid(iccid: &str) -> Result<&str> {
    let iccid = iccid.trim();
    if iccid.is_empty() || !iccid.bytes().all(|b| b.is_ascii_digit()) {
        return Err(EsimError::Validation(
            "ICCID must contain only digits".into(),
        ));
    }
    if !ICCID_RE.is_match(iccid) {
        return Err(EsimError::Validation(format!(
            "ICCID must be 18-22 digits long (got {})",
            iccid.len()
        )));
    }
    Ok(iccid)
}

/// Validate that a path is not empty and does not contain null bytes.
pub fn validate_path(p: &std::path::Path, label: &str) -> Result<()> {
    let s = p.to_string_lossy();
    if s.is_empty() {
        return Err(EsimError::Validation(format!("{label} path is empty")));
    }
    if s.contains('\0') {
        return Err(EsimError::Validation(format!(
            "{label} path contains null byte"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Version constants (set by build.rs)
// ---------------------------------------------------------------------------

pub const GIT_HASH: &str = env!("ESIMKIT_GIT_HASH");
pub const BUILD_TS: &str = env!("ESIMKIT_BUILD_TS");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One-line version string for display.
pub fn version_string() -> String {
    format!("esimkit v{VERSION} (git {GIT_HASH}, built {BUILD_TS})")
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
