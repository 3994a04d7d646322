//! TCF v2 consent string decoding.
//!
//! Decoding goes through the `iab_gpp` TCF EU v2 section. Only purpose and
//! vendor consents are kept; that is all the privacy gate needs.

use std::collections::BTreeSet;

use derive_more::Display;
use error_stack::Report;
use iab_gpp::sections::tcfeuv2::TcfEuV2;

/// Failure decoding a consent string.
#[derive(Debug, Display)]
pub enum TcfError {
    #[display("consent string is empty")]
    Empty,
    #[display("unsupported TCF version {_0}")]
    Version(u8),
    #[display("consent string could not be decoded")]
    Decode,
}

impl core::error::Error for TcfError {}

/// Consents decoded from the core segment of a TCF v2 string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcfConsent {
    pub cmp_id: u16,
    pub vendor_list_version: u16,
    purposes: BTreeSet<u16>,
    vendors: BTreeSet<u16>,
}

impl TcfConsent {
    /// Whether the user consented to purpose `purpose` (1-based).
    #[must_use]
    pub fn purpose_allowed(&self, purpose: u16) -> bool {
        self.purposes.contains(&purpose)
    }

    /// Whether the user consented to vendor `vendor_id`.
    #[must_use]
    pub fn vendor_allowed(&self, vendor_id: u16) -> bool {
        self.vendors.contains(&vendor_id)
    }
}

/// Version encoded in the first base64url character (its top 6 bits).
fn leading_version(consent: &str) -> Option<u8> {
    let first = *consent.as_bytes().first()?;
    first.is_ascii_uppercase().then(|| first - b'A')
}

/// Decodes a TCF v2 consent string.
///
/// # Errors
///
/// Returns [`TcfError`] for empty, non-v2 or undecodable input.
pub fn parse_consent(consent: &str) -> Result<TcfConsent, Report<TcfError>> {
    let consent = consent.trim();
    if consent.is_empty() {
        return Err(Report::new(TcfError::Empty));
    }

    match leading_version(consent) {
        Some(2) => {}
        Some(version) => return Err(Report::new(TcfError::Version(version))),
        None => return Err(Report::new(TcfError::Decode)),
    }

    let decoded = consent
        .parse::<TcfEuV2>()
        .map_err(|e| Report::new(TcfError::Decode).attach(format!("{e:?}")))?;
    let core = decoded.core;

    Ok(TcfConsent {
        cmp_id: core.cmp_id,
        vendor_list_version: core.vendor_list_version,
        purposes: core.purpose_consents.iter().map(|id| u16::from(*id)).collect(),
        vendors: core.vendor_consents.iter().map(|id| u16::from(*id)).collect(),
    })
}
