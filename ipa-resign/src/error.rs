// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    crate::entitlements::EntitlementsViolations, cryptographic_message_syntax::CmsError,
    std::path::PathBuf, thiserror::Error,
};

/// Unified error type for re-signing operations.
#[derive(Debug, Error)]
pub enum ResignError {
    #[error("{0}")]
    CliGeneralError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(#[from] figment::Error),

    #[error("bundle error: {0:#}")]
    DirectoryBundle(anyhow::Error),

    #[error("bundle root does not exist: {}", .0.display())]
    BundleRootMissing(PathBuf),

    #[error("failed to read CFBundleIdentifier from {}", .0.display())]
    BundleNoIdentifier(PathBuf),

    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),

    #[error("entitlements not found: {}", .0.display())]
    EntitlementsNotFound(PathBuf),

    #[error("entitlements plist is not a dictionary: {}", .0.display())]
    EntitlementsNotDictionary(PathBuf),

    #[error("{0}")]
    InvalidEntitlements(EntitlementsViolations),

    #[error("failed to launch {program}: {source}")]
    ToolLaunch {
        program: String,
        source: std::io::Error,
    },

    #[error("codesign failed: {}\n{stderr}", .path.display())]
    CodesignFailed { path: PathBuf, stderr: String },

    #[error("codesign verify failed: {}\n{stderr}", .path.display())]
    VerifyFailed { path: PathBuf, stderr: String },

    #[error("{program} failed: {stderr}")]
    ToolFailed { program: String, stderr: String },

    #[error("provisioning profile not found: {}", .0.display())]
    ProfileNotFound(PathBuf),

    #[error("CMS error: {0}")]
    Cms(#[from] CmsError),

    #[error("provisioning profile has no signed content")]
    ProfileNoContent,

    #[error("provisioning profile is not a dictionary")]
    ProfileNotDictionary,

    #[error("failed to extract team id from provisioning profile")]
    ProfileNoTeamId,

    #[error("provisioning profile has no DeveloperCertificates")]
    ProfileNoCertificates,

    #[error("missing signing identity; list available identities with `security find-identity -v -p codesigning` and pass one via --sign-identity")]
    NoSigningIdentity,
}
