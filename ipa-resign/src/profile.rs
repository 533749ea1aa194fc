// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Provisioning profiles and code signing identities.

A provisioning profile (`.mobileprovision`) is a CMS `SignedData` structure
whose encapsulated content is a plist. We care about 3 things in it: the
entitlements it grants, the team identifier, and the developer certificates
allowed to sign with it. The latter are matched against the identities in the
user's keychain to pick a signing identity when none was given.
*/

use {
    crate::{entitlements::team_id_from_application_identifier, error::ResignError},
    cryptographic_message_syntax::SignedData,
    once_cell::sync::Lazy,
    plist::{Dictionary, Value},
    regex::Regex,
    std::{io::Cursor, path::Path},
};

/// Profile key holding the granted entitlements.
pub const ENTITLEMENTS_KEY: &str = "Entitlements";

/// Profile key holding the DER encoded developer certificates.
pub const DEVELOPER_CERTIFICATES_KEY: &str = "DeveloperCertificates";

const TEAM_IDENTIFIER_ENTITLEMENT: &str = "com.apple.developer.team-identifier";

/// A parsed provisioning profile.
#[derive(Clone, Debug, PartialEq)]
pub struct Profile {
    /// The full profile content.
    pub raw: Dictionary,
    /// Team identifier entitlements are bound to.
    pub team_id: String,
    /// Entitlements granted by the profile.
    pub entitlements: Dictionary,
}

impl Profile {
    /// Construct an instance from decoded profile content.
    pub fn from_plist_dictionary(raw: Dictionary) -> Result<Self, ResignError> {
        let entitlements = raw
            .get(ENTITLEMENTS_KEY)
            .and_then(|v| v.as_dictionary())
            .cloned()
            .unwrap_or_default();

        let team_id = entitlements
            .get(TEAM_IDENTIFIER_ENTITLEMENT)
            .and_then(|v| v.as_string())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .or_else(|| {
                entitlements
                    .get("application-identifier")
                    .and_then(|v| v.as_string())
                    .and_then(team_id_from_application_identifier)
            })
            .ok_or(ResignError::ProfileNoTeamId)?
            .to_string();

        Ok(Self {
            raw,
            team_id,
            entitlements,
        })
    }

    /// Construct an instance from the raw bytes of a profile file.
    ///
    /// Accepts the CMS envelope as found in `.mobileprovision` files. Data
    /// that is already a plist, as produced by `security cms -D`, is also
    /// accepted.
    pub fn from_der(data: &[u8]) -> Result<Self, ResignError> {
        if is_plist_data(data) {
            return Self::from_plist_bytes(data);
        }

        let signed_data = SignedData::parse_ber(data)?;
        let content = signed_data
            .signed_content()
            .ok_or(ResignError::ProfileNoContent)?;

        Self::from_plist_bytes(content)
    }

    /// Construct an instance from a profile file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ResignError> {
        let path = path.as_ref();

        if !path.is_file() {
            return Err(ResignError::ProfileNotFound(path.to_path_buf()));
        }

        Self::from_der(&std::fs::read(path)?)
    }

    fn from_plist_bytes(data: &[u8]) -> Result<Self, ResignError> {
        let raw = Value::from_reader(Cursor::new(data))?
            .into_dictionary()
            .ok_or(ResignError::ProfileNotDictionary)?;

        Self::from_plist_dictionary(raw)
    }

    /// Name of the profile, if present.
    pub fn name(&self) -> Option<&str> {
        self.raw.get("Name").and_then(|v| v.as_string())
    }

    /// Uppercase hex SHA-1 fingerprints of the profile's developer certificates.
    ///
    /// Fingerprints are deduplicated and retain the order of the certificates
    /// in the profile. Entries that aren't data are ignored.
    pub fn developer_certificate_sha1s(&self) -> Vec<String> {
        let mut res: Vec<String> = vec![];

        let certs = self
            .raw
            .get(DEVELOPER_CERTIFICATES_KEY)
            .and_then(|v| v.as_array())
            .map(|a| a.as_slice())
            .unwrap_or_default();

        for data in certs.iter().filter_map(|v| v.as_data()) {
            let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, data);
            let fingerprint = hex::encode_upper(digest.as_ref());

            if !res.contains(&fingerprint) {
                res.push(fingerprint);
            }
        }

        res
    }

    /// Choose a signing identity for this profile.
    ///
    /// The first profile certificate with a matching entry in `identities`
    /// resolves to that identity's name. Without any match, the first
    /// certificate fingerprint is returned, which `codesign` also accepts.
    pub fn resolve_signing_identity(
        &self,
        identities: &[CodeSigningIdentity],
    ) -> Result<String, ResignError> {
        let fingerprints = self.developer_certificate_sha1s();

        for fingerprint in &fingerprints {
            if let Some(identity) = identities.iter().find(|i| &i.sha1 == fingerprint) {
                return Ok(identity.name.clone());
            }
        }

        fingerprints
            .into_iter()
            .next()
            .ok_or(ResignError::ProfileNoCertificates)
    }
}

fn is_plist_data(data: &[u8]) -> bool {
    data.starts_with(b"bplist")
        || data.starts_with(b"<?xml")
        || data.starts_with(b"<plist")
        || data.starts_with(b"\xef\xbb\xbf<?xml")
}

/// A code signing identity available in the keychain.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CodeSigningIdentity {
    /// Uppercase hex SHA-1 of the identity's certificate.
    pub sha1: String,
    /// Common name of the certificate.
    pub name: String,
}

static FIND_IDENTITY_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\s*\d+\)\s+([0-9A-Fa-f]{40})\s+"(.+)"\s*$"#).expect("regex should compile")
});

/// Parse the output of `security find-identity -v -p codesigning`.
///
/// Lines not describing an identity, like the trailing count, are ignored.
pub fn parse_find_identity_output(output: &str) -> Vec<CodeSigningIdentity> {
    output
        .lines()
        .filter_map(|line| FIND_IDENTITY_LINE.captures(line))
        .map(|caps| CodeSigningIdentity {
            sha1: caps[1].to_uppercase(),
            name: caps[2].to_string(),
        })
        .collect()
}
