//! Certificate utilities (spec.md §4.2).
//!
//! Pure functions, no global state: parse a PEM certificate and extract the
//! subject Common Name, or the not-before/not-after/serial triple. Used at
//! startup (`TlsState::init`) and during rotation (`rotation::renew`).

use crate::error::CertError;
use x509_parser::pem::Pem;

/// Subject common names longer than this are truncated, matching spec.md's
/// "truncates to ≤ 256 bytes".
const MAX_CN_LEN: usize = 256;

/// Rendered validity strings are bounded to this length ("≤ 64 bytes").
const MAX_TIME_STR_LEN: usize = 64;

fn decode_pem(pem: &[u8]) -> Result<Pem, CertError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem).map_err(|e| CertError::InvalidPem(e.to_string()))?;
    Ok(pem)
}

/// Extracts the subject's Common Name from a PEM-encoded certificate,
/// truncated to `MAX_CN_LEN` bytes on a UTF-8 boundary.
pub fn extract_cname(pem: &[u8]) -> Result<String, CertError> {
    let decoded = decode_pem(pem)?;
    let cert = decoded
        .parse_x509()
        .map_err(|e| CertError::InvalidPem(e.to_string()))?;

    let cn = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .ok_or(CertError::MissingCommonName)?;

    Ok(truncate_utf8(cn, MAX_CN_LEN))
}

/// A certificate's validity window and serial number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    pub not_before: String,
    pub not_after: String,
    pub serial: u128,
}

/// Extracts not-before/not-after (rendered as human-readable UTC strings)
/// and the integer serial. A zero serial is rejected as an invalid
/// certificate, per spec.md §4.2.
pub fn extract_validity(pem: &[u8]) -> Result<Validity, CertError> {
    let decoded = decode_pem(pem)?;
    let cert = decoded
        .parse_x509()
        .map_err(|e| CertError::InvalidPem(e.to_string()))?;

    let not_before = render_time(cert.validity().not_before.timestamp());
    let not_after = render_time(cert.validity().not_after.timestamp());

    // `raw_serial()` is the serial's big-endian DER bytes, including any
    // leading 0x00 pad byte ASN.1 INTEGER encoding adds to keep the value
    // non-negative — strip that padding before widening into a `u128`.
    // (`raw_serial_as_string()` renders the same bytes colon-separated for
    // display, which isn't reparsable as plain hex, so we go from bytes
    // directly instead of round-tripping through that string.)
    let raw = cert.raw_serial();
    let trimmed = match raw {
        [0x00, rest @ ..] if !rest.is_empty() => rest,
        other => other,
    };
    if trimmed.len() > 16 {
        return Err(CertError::SerialOverflow);
    }
    let mut buf = [0u8; 16];
    buf[16 - trimmed.len()..].copy_from_slice(trimmed);
    let serial = u128::from_be_bytes(buf);

    if serial == 0 {
        return Err(CertError::ZeroSerial);
    }

    Ok(Validity {
        not_before: truncate_utf8(&not_before, MAX_TIME_STR_LEN),
        not_after: truncate_utf8(&not_after, MAX_TIME_STR_LEN),
        serial,
    })
}

fn truncate_utf8(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn render_time(unix_ts: i64) -> String {
    use chrono::{DateTime, Utc};
    match DateTime::<Utc>::from_timestamp(unix_ts, 0) {
        Some(dt) => dt.format("%a %b %e %H:%M:%S %Y GMT").to_string(),
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CERT: &str = include_str!("../testdata/renegotiate_cert.pem");

    #[test]
    fn extract_cname_reads_subject_common_name() {
        assert_eq!(extract_cname(TEST_CERT.as_bytes()).unwrap(), "test.example");
    }

    #[test]
    fn extract_validity_reports_nonzero_serial_and_bounded_strings() {
        let validity = extract_validity(TEST_CERT.as_bytes()).unwrap();
        assert_ne!(validity.serial, 0);
        assert!(validity.not_before.len() <= MAX_TIME_STR_LEN);
        assert!(validity.not_after.len() <= MAX_TIME_STR_LEN);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "a".repeat(300);
        let t = truncate_utf8(&s, MAX_CN_LEN);
        assert_eq!(t.len(), MAX_CN_LEN);
    }

    #[test]
    fn render_time_is_bounded() {
        let s = render_time(1_700_000_000);
        assert!(s.len() <= MAX_TIME_STR_LEN);
    }

    #[test]
    fn render_time_unknown_on_overflow() {
        let s = render_time(i64::MAX);
        assert_eq!(s, "unknown");
    }
}
