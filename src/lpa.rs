//! LPA activation-code codec.
//!
//! Wire grammar (bit-exact): `LPA:1$<server-address>$<activation-code>`.
//! Both `$` delimiters are mandatory; the activation-code segment may be
//! empty.  Everything in this module is pure; no I/O, no state.

use serde::Serialize;
use tracing::debug;

use crate::error::{EsimError, OptionExt as _, Result};
use crate::util;

pub const LPA_PREFIX: &str = "LPA:1$";

/// Apple universal link that hands an activation code to the iOS installer.
/// The LPA string is appended verbatim (not percent-encoded).
pub const INSTALL_LINK_BASE: &str =
    "https://esimsetup.apple.com/esim_qrcode_provisioning?carddata=";

pub const SERVER_ADDRESS_MIN_LEN: usize = 5;
pub const SERVER_ADDRESS_MAX_LEN: usize = 255;

static SERVER_ADDRESS_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"^[A-Za-z0-9.-]+$").unwrap());

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// A parsed activation code.
///
/// `raw` is always `build(server_address, activation_code)`; the fields are
/// private so the two can never drift apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ActivationDescriptor {
    server_address: String,
    activation_code: Option<String>,
    raw: String,
}

impl ActivationDescriptor {
    /// Build a descriptor without validating the server address.
    ///
    /// An empty or whitespace-only code is stored as `None`.
    pub fn new(server_address: &str, activation_code: Option<&str>) -> Self {
        let activation_code = activation_code
            .filter(|c| !c.trim().is_empty())
            .map(str::to_string);
        let raw = build(server_address, activation_code.as_deref());
        Self {
            server_address: server_address.to_string(),
            activation_code,
            raw,
        }
    }

    /// Build a descriptor from caller-supplied fields, rejecting anything
    /// that would not survive a `parse(build(..))` round trip.
    pub fn validated(server_address: &str, activation_code: Option<&str>) -> Result<Self> {
        let server_address = server_address.trim();
        validate_server_address(server_address)?;
        if let Some(code) = activation_code {
            if code.contains('$') {
                return Err(EsimError::Validation(
                    "activation code must not contain '$'".into(),
                ));
            }
            if code.chars().any(char::is_control) {
                return Err(EsimError::Validation(
                    "activation code must not contain control characters".into(),
                ));
            }
        }
        Ok(Self::new(server_address, activation_code.map(str::trim)))
    }

    pub fn server_address(&self) -> &str {
        &self.server_address
    }

    pub fn activation_code(&self) -> Option<&str> {
        self.activation_code.as_deref()
    }

    /// Canonical `LPA:1$...$...` string.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn install_link(&self) -> String {
        install_link(self)
    }
}

impl std::fmt::Display for ActivationDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

// ---------------------------------------------------------------------------
// Grammar
// ---------------------------------------------------------------------------

/// Render the wire form.  The trailing segment is always present, empty when
/// there is no code.
pub fn build(server_address: &str, activation_code: Option<&str>) -> String {
    let code = activation_code
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_default();
    format!("{LPA_PREFIX}{server_address}${code}")
}

/// Parse the wire form.  Surrounding whitespace is ignored; everything else
/// must match the grammar exactly.
pub fn parse(raw: &str) -> Result<ActivationDescriptor> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(EsimError::Format("LPA string must not be empty".into()));
    }
    if s.chars().any(char::is_control) {
        return Err(EsimError::Format(
            "LPA string must not contain control characters".into(),
        ));
    }
    let rest = s
        .strip_prefix(LPA_PREFIX)
        .required_format("LPA string must have the form LPA:1$SERVER$CODE")?;

    let mut segments = rest.split('$');
    let server = segments.next().unwrap_or_default();
    let code = segments
        .next()
        .required_format("LPA string is missing the second '$' delimiter")?;
    let extra = segments.count();
    if extra > 0 {
        return Err(EsimError::Format(format!(
            "LPA string must contain exactly two '$' delimiters (found {})",
            extra + 2
        )));
    }
    if server.is_empty() {
        return Err(EsimError::Format("LPA server address segment is empty".into()));
    }

    Ok(ActivationDescriptor::new(server, Some(code)))
}

/// Check that `s` looks like an SM-DP+ domain.
pub fn validate_server_address(s: &str) -> Result<()> {
    if s.trim().is_empty() {
        return Err(EsimError::Validation(
            "SM-DP+ address must not be empty".into(),
        ));
    }
    if !SERVER_ADDRESS_RE.is_match(s) {
        return Err(EsimError::Validation(
            "SM-DP+ address contains invalid characters (allowed: letters, digits, '.', '-')"
                .into(),
        ));
    }
    if !s.contains('.') {
        return Err(EsimError::Validation(
            "SM-DP+ address must be a domain name".into(),
        ));
    }
    if !(SERVER_ADDRESS_MIN_LEN..=SERVER_ADDRESS_MAX_LEN).contains(&s.len()) {
        return Err(EsimError::Validation(format!(
            "SM-DP+ address length {} out of range [{SERVER_ADDRESS_MIN_LEN}, {SERVER_ADDRESS_MAX_LEN}]",
            s.len()
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tolerant classification
// ---------------------------------------------------------------------------

/// Outcome of [`extract`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum Extraction {
    /// A grammar-conformant activation code.
    Lpa(ActivationDescriptor),
    /// An http(s) URL without a usable `carddata` parameter.
    Url { url: String },
    /// Text that looks like a bare SM-DP+ address (not validated).
    ServerAddress { server_address: String },
    /// Nothing matched; carries the caller's text verbatim.
    Unrecognized { original: String },
}

impl Extraction {
    /// Short label for display.
    pub fn format_name(&self) -> &'static str {
        match self {
            Self::Lpa(_) => "LPA",
            Self::Url { .. } => "URL",
            Self::ServerAddress { .. } => "SM-DP+",
            Self::Unrecognized { .. } => "unknown",
        }
    }

    pub fn descriptor(&self) -> Option<&ActivationDescriptor> {
        match self {
            Self::Lpa(d) => Some(d),
            _ => None,
        }
    }

    pub fn server_address(&self) -> Option<&str> {
        match self {
            Self::Lpa(d) => Some(d.server_address()),
            Self::ServerAddress { server_address } => Some(server_address),
            _ => None,
        }
    }

    pub fn activation_code(&self) -> Option<&str> {
        self.descriptor().and_then(ActivationDescriptor::activation_code)
    }
}

/// One step of the classification chain.
pub struct Matcher {
    pub name: &'static str,
    /// Receives the trimmed text and the number of wrapper layers (URL or
    /// base64) already removed.
    pub try_match: fn(&str, usize) -> Option<Extraction>,
}

impl std::fmt::Debug for Matcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Matcher").field("name", &self.name).finish()
    }
}

/// Classification order.  First match wins.
///
/// The URL matcher runs before the bare-address matcher, so any http(s)
/// text is reported as a URL even when its host alone would pass as an
/// SM-DP+ address.
pub const MATCHERS: &[Matcher] = &[
    Matcher { name: "lpa", try_match: match_lpa },
    Matcher { name: "carddata_url", try_match: match_url },
    Matcher { name: "server_address", try_match: match_server_address },
    Matcher { name: "base64_lpa", try_match: match_base64_lpa },
];

/// Wrapper layers unwrapped before classification stops.  One URL around
/// one base64 payload is the deepest real-world nesting.
pub const MAX_UNWRAP_DEPTH: usize = 2;

/// Classify free-form input.  Never fails.
pub fn extract(text: &str) -> Extraction {
    classify(text, 0)
}

fn classify(text: &str, depth: usize) -> Extraction {
    let trimmed = text.trim();
    for m in MATCHERS {
        if let Some(found) = (m.try_match)(trimmed, depth) {
            debug!(matcher = m.name, format = found.format_name(), "input classified");
            return found;
        }
    }
    Extraction::Unrecognized {
        original: text.to_string(),
    }
}

fn match_lpa(text: &str, _depth: usize) -> Option<Extraction> {
    parse(text).ok().map(Extraction::Lpa)
}

fn is_http_url(text: &str) -> bool {
    let lower = text.get(..8).unwrap_or(text).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn match_url(text: &str, depth: usize) -> Option<Extraction> {
    if !is_http_url(text) {
        return None;
    }
    let carddata = reqwest::Url::parse(text).ok().and_then(|url| {
        url.query_pairs()
            .find(|(k, _)| k == "carddata")
            .map(|(_, v)| v.into_owned())
    });
    match carddata {
        Some(payload) if !payload.trim().is_empty() && depth < MAX_UNWRAP_DEPTH => {
            Some(classify(&payload, depth + 1))
        }
        _ => Some(Extraction::Url {
            url: text.to_string(),
        }),
    }
}

fn match_server_address(text: &str, _depth: usize) -> Option<Extraction> {
    (text.contains('.') && text.chars().count() > 10).then(|| Extraction::ServerAddress {
        server_address: text.to_string(),
    })
}

fn match_base64_lpa(text: &str, depth: usize) -> Option<Extraction> {
    if depth >= MAX_UNWRAP_DEPTH {
        return None;
    }
    let bytes = util::b64_decode_lenient(text).ok()?;
    let decoded = String::from_utf8(bytes).ok()?;
    decoded.contains("LPA:").then(|| classify(&decoded, depth + 1))
}

// ---------------------------------------------------------------------------
// Install links
// ---------------------------------------------------------------------------

pub fn install_link(descriptor: &ActivationDescriptor) -> String {
    format!("{INSTALL_LINK_BASE}{}", descriptor.raw())
}

/// Turn scanned or pasted text into an install link.
///
/// LPA text is wrapped as-is, http(s) URLs are returned unchanged, anything
/// else is treated as a bare SM-DP+ address with no activation code.
pub fn install_link_for(text: &str) -> String {
    let text = text.trim();
    if text.starts_with("LPA:") {
        format!("{INSTALL_LINK_BASE}{text}")
    } else if is_http_url(text) {
        text.to_string()
    } else {
        format!("{INSTALL_LINK_BASE}{}", build(text, None))
    }
}

// ---------------------------------------------------------------------------
// Inspection report
// ---------------------------------------------------------------------------

/// Human-oriented summary of what a piece of input contains.
#[derive(Debug, Clone, Serialize)]
pub struct Inspection {
    pub original: String,
    pub format: &'static str,
    pub server_address: Option<String>,
    pub activation_code: Option<String>,
    pub is_valid: bool,
    pub install_link: Option<String>,
    pub notes: Vec<String>,
}

pub fn inspect(text: &str) -> Inspection {
    let extraction = extract(text);
    let mut notes = Vec::new();

    let server_address = extraction.server_address().map(str::to_string);
    let activation_code = extraction.activation_code().map(str::to_string);

    let is_valid = match server_address.as_deref() {
        Some(server) => match validate_server_address(server) {
            Ok(()) => true,
            Err(e) => {
                notes.push(e.reason());
                false
            }
        },
        None => {
            notes.push(match &extraction {
                Extraction::Url { .. } => "URL has no carddata parameter".to_string(),
                _ => "no SM-DP+ address found".to_string(),
            });
            false
        }
    };

    let install_link = if is_valid {
        if activation_code.is_some() {
            notes.push("activation code present".to_string());
        } else {
            notes.push("no activation code (may not be required)".to_string());
        }
        server_address
            .as_deref()
            .map(|s| install_link(&ActivationDescriptor::new(s, activation_code.as_deref())))
    } else {
        None
    };

    Inspection {
        original: text.to_string(),
        format: extraction.format_name(),
        server_address,
        activation_code,
        is_valid,
        install_link,
        notes,
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn build_with_and_without_code() {
        assert_eq!(
            build("rsp.truphone.com", Some("ABC123")),
            "LPA:1$rsp.truphone.com$ABC123"
        );
        assert_eq!(build("rsp.truphone.com", None), "LPA:1$rsp.truphone.com$");
        assert_eq!(build("rsp.truphone.com", Some("  ")), "LPA:1$rsp.truphone.com$");
    }

    #[test]
    fn parse_empty_code_segment() {
        let d = parse("LPA:1$rsp.truphone.com$").unwrap();
        assert_eq!(d.server_address(), "rsp.truphone.com");
        assert_eq!(d.activation_code(), None);
        assert_eq!(d.raw(), "LPA:1$rsp.truphone.com$");
    }

    #[test]
    fn parse_trims_surrounding_whitespace() {
        let d = parse("  LPA:1$smdp.io$K2-19AB  \n").unwrap();
        assert_eq!(d.activation_code(), Some("K2-19AB"));
        assert_eq!(d.raw(), "LPA:1$smdp.io$K2-19AB");
    }

    #[test]
    fn parse_rejects_grammar_violations() {
        for bad in [
            "",
            "LPA:1$rsp.truphone.com",
            "LPA:1$$ABC",
            "LPA:2$rsp.truphone.com$ABC",
            "lpa:1$rsp.truphone.com$ABC",
            "LPA:1$rsp.truphone.com$ABC$DEF",
            "rsp.truphone.com$ABC",
        ] {
            let err = parse(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Format, "input {bad:?}");
        }
    }

    #[test]
    fn server_address_validation() {
        assert!(validate_server_address("rsp.truphone.com").is_ok());
        assert!(validate_server_address("a.bc").is_err());
        assert_eq!(
            validate_server_address("not a domain").unwrap_err().kind(),
            ErrorKind::Validation
        );
        assert!(validate_server_address("localhost").is_err());
        assert!(validate_server_address("").is_err());
        assert!(validate_server_address(&format!("{}.com", "a".repeat(252))).is_err());
    }

    #[test]
    fn validated_rejects_dollar_in_code() {
        assert!(ActivationDescriptor::validated("rsp.truphone.com", Some("A$B")).is_err());
        let d = ActivationDescriptor::validated(" rsp.truphone.com ", Some(" AB ")).unwrap();
        assert_eq!(d.raw(), "LPA:1$rsp.truphone.com$AB");
    }

    #[test]
    fn extract_percent_encoded_carddata() {
        let e = extract("https://x/y?carddata=LPA%3A1%24rsp.truphone.com%24ABC");
        assert_eq!(e.server_address(), Some("rsp.truphone.com"));
        assert_eq!(e.activation_code(), Some("ABC"));
    }

    #[test]
    fn extract_verbatim_install_link() {
        let d = ActivationDescriptor::new("smdp.gsma.example", Some("X-1"));
        let e = extract(&d.install_link());
        assert_eq!(e, Extraction::Lpa(d));
    }

    #[test]
    fn extract_url_without_carddata() {
        let e = extract("https://operator.example.com/activate?id=7");
        assert_eq!(e.format_name(), "URL");
        assert_eq!(e.server_address(), None);
    }

    #[test]
    fn extract_bare_server_address() {
        let e = extract("sm-v4-004-a-gtm.pr.go-esim.com");
        assert_eq!(
            e,
            Extraction::ServerAddress {
                server_address: "sm-v4-004-a-gtm.pr.go-esim.com".into()
            }
        );
        // Too short for the bare-address heuristic.
        assert_eq!(extract("a.b.c").format_name(), "unknown");
    }

    #[test]
    fn extract_base64_lpa() {
        let encoded = util::b64_encode(b"LPA:1$rsp.truphone.com$QR-77");
        let e = extract(encoded.trim_end_matches('='));
        assert_eq!(e.activation_code(), Some("QR-77"));
    }

    #[test]
    fn extract_unrecognized_is_verbatim() {
        let e = extract(" hello ");
        assert_eq!(
            e,
            Extraction::Unrecognized {
                original: " hello ".into()
            }
        );
    }

    #[test]
    fn extract_url_wrapping_base64() {
        let encoded = util::b64_encode(b"LPA:1$rsp.truphone.com$WRAP");
        let e = extract(&format!("https://x.example/p?carddata={encoded}"));
        assert_eq!(e.activation_code(), Some("WRAP"));
    }

    #[test]
    fn deeply_nested_carddata_stops_unwrapping() {
        let prefix = "http://a.b/?carddata=".repeat(5_000);
        let e = extract(&format!("{prefix}LPA:1$rsp.truphone.com$X"));
        assert_eq!(e.format_name(), "URL");

        // Exactly at the limit the payload is still classified.
        let two = "http://a.b/?carddata=http://a.b/?carddata=LPA:1$rsp.truphone.com$X";
        assert_eq!(extract(two).activation_code(), Some("X"));
    }

    #[test]
    fn matcher_order_is_fixed() {
        let names: Vec<_> = MATCHERS.iter().map(|m| m.name).collect();
        assert_eq!(names, ["lpa", "carddata_url", "server_address", "base64_lpa"]);
    }

    #[test]
    fn install_link_variants() {
        assert_eq!(
            install_link_for("LPA:1$rsp.truphone.com$A"),
            "https://esimsetup.apple.com/esim_qrcode_provisioning?carddata=LPA:1$rsp.truphone.com$A"
        );
        assert_eq!(install_link_for("https://a.example/x"), "https://a.example/x");
        assert_eq!(
            install_link_for("rsp.truphone.com"),
            "https://esimsetup.apple.com/esim_qrcode_provisioning?carddata=LPA:1$rsp.truphone.com$"
        );
    }

    #[test]
    fn inspect_reports_validity() {
        let ok = inspect("LPA:1$rsp.truphone.com$");
        assert!(ok.is_valid);
        assert_eq!(ok.format, "LPA");
        assert!(ok.install_link.is_some());
        assert!(ok.notes.iter().any(|n| n.contains("no activation code")));

        let bad = inspect("LPA:1$bad_host$CODE");
        assert!(!bad.is_valid);
        assert!(bad.install_link.is_none());
        assert!(bad.notes[0].contains("invalid characters"));
    }
}
