// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! End to end re-signing of an extracted application.

[Resigner] ties everything together. Given an application, it:

1. Locates the main application bundle.
2. Scans for nested bundles and maps their identifiers.
3. Applies identity edits to each `Info.plist` (in memory).
4. Resolves and validates the entitlements of every bundle.
5. Writes the edited `Info.plist` files and embeds the provisioning profile.
6. Signs the bundle tree and verifies the result.

Invalid entitlements abort the run before any file is modified. In dry run
mode, steps 5 and 6 are skipped and only the report is produced.
*/

use {
    crate::{
        bundle_signing::{BundleSigner, SigningPlan},
        entitlements::resolve_entitlements,
        error::ResignError,
        identifier::collect_identifier_mappings,
        info_plist::apply_identity_edits,
        settings::ResignSettings,
        signing_service::SigningService,
    },
    anyhow::anyhow,
    ipa_bundles::{find_main_app, read_manifest_identifier, scan_bundles, DirectoryBundle},
    log::{info, warn},
    std::path::{Path, PathBuf},
};

/// Name of the directory holding the main application in an `.ipa`.
pub const PAYLOAD_DIR: &str = "Payload";

/// File name of the provisioning profile embedded in the main application.
pub const EMBEDDED_PROFILE_NAME: &str = "embedded.mobileprovision";

/// Locate the main application bundle for an input path.
///
/// The input can be an `.app` directory, a `Payload` directory, or a
/// directory containing `Payload/` (an extracted `.ipa`).
pub fn resolve_main_app(input: &Path, main_app_name: Option<&str>) -> Result<PathBuf, ResignError> {
    if !input.exists() {
        return Err(ResignError::BundleRootMissing(input.to_path_buf()));
    }

    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    if input.is_dir() && name.ends_with(ipa_bundles::APP_SUFFIX) {
        return Ok(input.to_path_buf());
    }

    let payload = if name == PAYLOAD_DIR {
        input.to_path_buf()
    } else {
        input.join(PAYLOAD_DIR)
    };

    if !payload.is_dir() {
        return Err(ResignError::DirectoryBundle(anyhow!(
            "{} is neither an application bundle nor contains {}/",
            input.display(),
            PAYLOAD_DIR
        )));
    }

    find_main_app(&payload, main_app_name).map_err(ResignError::DirectoryBundle)
}

/// Outcome of a re-signing run.
#[derive(Clone, Debug)]
pub struct ResignReport {
    /// Path of the main application bundle.
    pub main_app: PathBuf,
    /// Identifier of the main application before the run.
    pub old_main_id: String,
    /// Requested identifier of the main application.
    pub new_main_id: Option<String>,
    /// Every bundle found, main application first.
    pub bundles: Vec<PathBuf>,
    /// Number of bundles whose identifier changed.
    pub changed_identifiers: usize,
    /// Number of URL type values rewritten.
    pub url_type_values: usize,
    /// Number of other `Info.plist` string values rewritten.
    pub string_values: usize,
    /// Provisioning profile embedded in the main application.
    pub embedded_profile: Option<PathBuf>,
    /// Number of bundles for which entitlements were prepared.
    pub entitlements_prepared: usize,
    /// The signing operations, in order.
    pub plan: SigningPlan,
    /// Whether nothing was modified.
    pub dry_run: bool,
}

impl std::fmt::Display for ResignReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let app_name = self
            .main_app
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        if self.dry_run {
            writeln!(f, "Dry run:")?;
        } else {
            writeln!(f, "Re-signed:")?;
        }
        writeln!(f, "  App                         : {}", app_name)?;
        writeln!(f, "  Old identifier              : {}", self.old_main_id)?;
        if let Some(new) = &self.new_main_id {
            writeln!(f, "  New identifier              : {}", new)?;
        }
        writeln!(f, "  Bundles scanned             : {}", self.bundles.len())?;
        writeln!(f, "  Bundle identifiers changed  : {}", self.changed_identifiers)?;
        writeln!(f, "  URL type values rewritten   : {}", self.url_type_values)?;
        writeln!(f, "  Other string rewrites       : {}", self.string_values)?;
        match &self.embedded_profile {
            Some(p) => writeln!(f, "  Embed profile               : yes ({})", p.display())?,
            None => writeln!(f, "  Embed profile               : no")?,
        }
        writeln!(
            f,
            "  Entitlements prepared       : {} bundle(s)",
            self.entitlements_prepared
        )?;
        write!(f, "  Signing steps               : {}", self.plan.len())?;
        if self.dry_run {
            write!(f, "\n  Note                        : no files were modified")?;
        }

        Ok(())
    }
}

/// Re-signs an application according to [ResignSettings].
pub struct Resigner<'a> {
    settings: ResignSettings,
    service: &'a dyn SigningService,
}

impl<'a> Resigner<'a> {
    pub fn new(settings: ResignSettings, service: &'a dyn SigningService) -> Self {
        Self { settings, service }
    }

    pub fn settings(&self) -> &ResignSettings {
        &self.settings
    }

    /// Run the pipeline against an input path.
    ///
    /// See [resolve_main_app()] for accepted inputs.
    pub fn resign(&self, input: impl AsRef<Path>) -> Result<ResignReport, ResignError> {
        let settings = &self.settings;
        let main_app = resolve_main_app(input.as_ref(), settings.main_app_name())?;
        warn!("re-signing {}", main_app.display());

        let old_main_id = read_manifest_identifier(&main_app)
            .ok_or_else(|| ResignError::BundleNoIdentifier(main_app.clone()))?;
        let new_main_id = settings.bundle_id().unwrap_or_default();

        let bundles = scan_bundles(&main_app);
        info!("found {} bundles", bundles.len());

        let mappings = collect_identifier_mappings(&bundles, &old_main_id, new_main_id);

        let edits = settings.info_plist_edits();
        let mut edited = vec![];
        let mut changed_identifiers = 0;
        let mut url_type_values = 0;
        let mut string_values = 0;

        for (path, mapping) in &mappings {
            let mut bundle =
                DirectoryBundle::new_from_path(path).map_err(ResignError::DirectoryBundle)?;
            let changes = apply_identity_edits(bundle.info_plist_mut(), mapping, &edits);

            if changes.identifier_changed {
                changed_identifiers += 1;
            }
            url_type_values += changes.url_type_values;
            string_values += changes.string_values;

            if changes.url_type_values > 0 || changes.string_values > 0 {
                info!(
                    "{}: rewrote {} URL type value(s) and {} other value(s)",
                    path.display(),
                    changes.url_type_values,
                    changes.string_values
                );
            }

            edited.push(bundle);
        }

        let entitlements = resolve_entitlements(
            &bundles,
            &mappings,
            settings.entitlements(),
            settings.profile(),
            |p| self.service.extract_entitlements(p),
            settings.strict_entitlements(),
        )?;

        let signer = BundleSigner::new_from_path(&main_app)?;

        let report = ResignReport {
            main_app: main_app.clone(),
            old_main_id,
            new_main_id: settings.bundle_id().map(|s| s.to_string()),
            bundles,
            changed_identifiers,
            url_type_values,
            string_values,
            embedded_profile: settings.profile_path().map(|p| p.to_path_buf()),
            entitlements_prepared: entitlements.values().filter(|e| e.is_some()).count(),
            plan: signer.plan(),
            dry_run: settings.dry_run(),
        };

        if settings.dry_run() {
            warn!("dry run; not modifying anything");
            return Ok(report);
        }

        for bundle in &edited {
            info!("writing {}", bundle.info_plist_path().display());
            bundle
                .write_info_plist()
                .map_err(ResignError::DirectoryBundle)?;
        }

        if let Some(profile_path) = settings.profile_path() {
            let dest = main_app.join(EMBEDDED_PROFILE_NAME);
            warn!("embedding provisioning profile {}", profile_path.display());
            std::fs::copy(profile_path, dest)?;
        }

        signer.sign_tree(settings, &entitlements, self.service)?;
        warn!("{} signed and verified", main_app.display());

        Ok(report)
    }
}
