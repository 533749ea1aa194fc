// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Settings of a re-signing run.

use {
    crate::{info_plist::InfoPlistEdits, profile::Profile},
    plist::Dictionary,
    std::path::{Path, PathBuf},
};

/// Parameters of a re-signing run.
///
/// An instance is configured up front and then only read while bundles are
/// processed.
#[derive(Clone, Debug, Default)]
pub struct ResignSettings {
    signing_identity: Option<String>,
    entitlements: Option<Dictionary>,
    profile: Option<Profile>,
    profile_path: Option<PathBuf>,
    strict_entitlements: bool,
    verbose: bool,
    bundle_id: Option<String>,
    bundle_version: Option<String>,
    build: Option<String>,
    display_name: Option<String>,
    rewrite_bundle_id_values: bool,
    main_app_name: Option<String>,
    dry_run: bool,
}

impl ResignSettings {
    /// The identity `codesign` signs with.
    ///
    /// Either a certificate common name or its SHA-1 fingerprint.
    pub fn signing_identity(&self) -> Option<&str> {
        self.signing_identity.as_deref()
    }

    pub fn set_signing_identity(&mut self, value: impl ToString) {
        self.signing_identity = Some(value.to_string());
    }

    /// Entitlements to use for every bundle, ignoring other sources.
    pub fn entitlements(&self) -> Option<&Dictionary> {
        self.entitlements.as_ref()
    }

    pub fn set_entitlements(&mut self, entitlements: Dictionary) {
        self.entitlements = Some(entitlements);
    }

    /// The provisioning profile to embed and take entitlements from.
    pub fn profile(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    /// Path of the file the profile was loaded from.
    pub fn profile_path(&self) -> Option<&Path> {
        self.profile_path.as_deref()
    }

    /// Set the provisioning profile along with the file it came from.
    ///
    /// The file is copied into the main application.
    pub fn set_profile(&mut self, profile: Profile, path: impl Into<PathBuf>) {
        self.profile = Some(profile);
        self.profile_path = Some(path.into());
    }

    /// Whether entitlements must declare an application identifier.
    pub fn strict_entitlements(&self) -> bool {
        self.strict_entitlements
    }

    pub fn set_strict_entitlements(&mut self, v: bool) {
        self.strict_entitlements = v;
    }

    /// Whether tool invocations are reported to the operator.
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn set_verbose(&mut self, v: bool) {
        self.verbose = v;
    }

    /// New identifier of the main application.
    pub fn bundle_id(&self) -> Option<&str> {
        self.bundle_id.as_deref()
    }

    /// Set the new main application identifier.
    ///
    /// Surrounding whitespace is removed. A blank value clears the setting so
    /// identifiers are kept.
    pub fn set_bundle_id(&mut self, value: impl ToString) {
        let value = value.to_string();
        let value = value.trim();

        self.bundle_id = if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        };
    }

    /// New `CFBundleShortVersionString`.
    pub fn bundle_version(&self) -> Option<&str> {
        self.bundle_version.as_deref()
    }

    pub fn set_bundle_version(&mut self, value: impl ToString) {
        self.bundle_version = Some(value.to_string());
    }

    /// New `CFBundleVersion`.
    pub fn build(&self) -> Option<&str> {
        self.build.as_deref()
    }

    pub fn set_build(&mut self, value: impl ToString) {
        self.build = Some(value.to_string());
    }

    /// New `CFBundleDisplayName` and `CFBundleName`.
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn set_display_name(&mut self, value: impl ToString) {
        self.display_name = Some(value.to_string());
    }

    /// Whether every string in `Info.plist` follows the identifier change.
    pub fn rewrite_bundle_id_values(&self) -> bool {
        self.rewrite_bundle_id_values
    }

    pub fn set_rewrite_bundle_id_values(&mut self, v: bool) {
        self.rewrite_bundle_id_values = v;
    }

    /// Name of the main application under `Payload/`.
    pub fn main_app_name(&self) -> Option<&str> {
        self.main_app_name.as_deref()
    }

    pub fn set_main_app_name(&mut self, value: impl ToString) {
        self.main_app_name = Some(value.to_string());
    }

    /// Whether to only report what would change.
    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn set_dry_run(&mut self, v: bool) {
        self.dry_run = v;
    }

    /// `Info.plist` edits derived from these settings.
    pub fn info_plist_edits(&self) -> InfoPlistEdits {
        InfoPlistEdits {
            short_version: self.bundle_version.clone(),
            build: self.build.clone(),
            display_name: self.display_name.clone(),
            rewrite_bundle_id_values: self.rewrite_bundle_id_values,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bundle_id_trimmed() {
        let mut settings = ResignSettings::default();
        assert_eq!(settings.bundle_id(), None);

        settings.set_bundle_id("  com.new.app\n");
        assert_eq!(settings.bundle_id(), Some("com.new.app"));

        settings.set_bundle_id("   ");
        assert_eq!(settings.bundle_id(), None);

        settings.set_bundle_id("");
        assert_eq!(settings.bundle_id(), None);
    }
}
