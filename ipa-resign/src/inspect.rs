// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Read-only summaries of an application.

use {
    crate::{
        bundle_signing::{BundleSigner, SigningPlan},
        error::ResignError,
        info_plist::url_schemes,
    },
    ipa_bundles::{scan_bundles, BundlePackageType, DirectoryBundle},
    log::debug,
    std::path::{Path, PathBuf},
};

/// Render a path relative to the directory holding the main application.
pub(crate) fn display_relative(path: &Path, main_app: &Path) -> String {
    main_app
        .parent()
        .and_then(|base| path.strip_prefix(base).ok())
        .unwrap_or(path)
        .display()
        .to_string()
}

/// The existing code signature of a bundle, as reported by `codesign -dvv`.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SignatureInfo {
    /// Whether the bundle carries a valid signature.
    pub signed: bool,
    /// Signing identifier (`Identifier=`).
    pub identifier: Option<String>,
    /// Team of the signing certificate (`TeamIdentifier=`).
    pub team_id: Option<String>,
    /// Certificate chain, leaf first (`Authority=`).
    pub authorities: Vec<String>,
    /// Why the signature couldn't be read.
    pub error: Option<String>,
}

impl SignatureInfo {
    /// An unsigned result with a reason.
    pub fn unsigned(error: impl ToString) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

/// Parse the report of `codesign -dvv`.
///
/// `success` is whether `codesign` exited successfully. Fields are extracted
/// either way. On failure, the last non-empty line is kept as the error.
pub fn parse_codesign_display(text: &str, success: bool) -> SignatureInfo {
    let mut info = SignatureInfo {
        signed: success,
        ..Default::default()
    };

    for line in text.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("Identifier=") {
            info.identifier = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("TeamIdentifier=") {
            info.team_id = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Authority=") {
            info.authorities.push(value.trim().to_string());
        }
    }

    if !success {
        info.error = Some(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .last()
                .unwrap_or("codesign inspect failed")
                .to_string(),
        );
    }

    info
}

/// A bundle found in an application.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BundleSummary {
    pub path: PathBuf,
    /// `None` if the bundle couldn't be opened and its suffix is unknown.
    pub package_type: Option<BundlePackageType>,
    pub identifier: Option<String>,
    pub has_embedded_profile: bool,
}

impl BundleSummary {
    fn from_path(path: PathBuf) -> Self {
        match DirectoryBundle::new_from_path(&path) {
            Ok(bundle) => Self {
                package_type: Some(bundle.package_type()),
                identifier: bundle.identifier().ok().flatten(),
                has_embedded_profile: bundle.has_embedded_profile(),
                path,
            },
            Err(e) => {
                debug!("unable to open bundle {}: {:#}", path.display(), e);

                let package_type = path
                    .file_name()
                    .and_then(|n| BundlePackageType::from_directory_name(&n.to_string_lossy()));

                Self {
                    package_type,
                    identifier: None,
                    has_embedded_profile: false,
                    path,
                }
            }
        }
    }
}

/// Key metadata of an application, gathered without modifying anything.
#[derive(Clone, Debug)]
pub struct AppInfo {
    /// Path of the main application bundle.
    pub main_app: PathBuf,
    pub identifier: Option<String>,
    /// `CFBundleDisplayName`, else `CFBundleName`.
    pub display_name: Option<String>,
    /// `CFBundleShortVersionString`.
    pub version: Option<String>,
    /// `CFBundleVersion`.
    pub build: Option<String>,
    pub min_os_version: Option<String>,
    pub url_schemes: Vec<String>,
    pub has_embedded_profile: bool,
    /// Every bundle found, main application first.
    pub bundles: Vec<BundleSummary>,
    /// The order bundles would be signed in.
    pub plan: SigningPlan,
    /// Signature of the main application, if it was queried.
    pub signature: Option<SignatureInfo>,
}

impl AppInfo {
    /// Gather metadata of the main application bundle at `main_app`.
    pub fn from_main_app(main_app: &Path) -> Result<Self, ResignError> {
        if !main_app.is_dir() {
            return Err(ResignError::BundleRootMissing(main_app.to_path_buf()));
        }

        let bundle =
            DirectoryBundle::new_from_path(main_app).map_err(ResignError::DirectoryBundle)?;

        let display_name = match bundle.display_name().map_err(ResignError::DirectoryBundle)? {
            Some(name) if !name.is_empty() => Some(name),
            _ => bundle
                .info_plist_key_string("CFBundleName")
                .map_err(ResignError::DirectoryBundle)?,
        };

        Ok(Self {
            main_app: bundle.root_dir().to_path_buf(),
            identifier: bundle.identifier().map_err(ResignError::DirectoryBundle)?,
            display_name,
            version: bundle.short_version().map_err(ResignError::DirectoryBundle)?,
            build: bundle.version().map_err(ResignError::DirectoryBundle)?,
            min_os_version: bundle
                .minimum_os_version()
                .map_err(ResignError::DirectoryBundle)?,
            url_schemes: url_schemes(bundle.info_plist()),
            has_embedded_profile: bundle.has_embedded_profile(),
            bundles: scan_bundles(main_app)
                .into_iter()
                .map(BundleSummary::from_path)
                .collect(),
            plan: BundleSigner::new_from_path(main_app)?.plan(),
            signature: None,
        })
    }

    /// Attach the signature of the main application.
    pub fn with_signature(mut self, signature: SignatureInfo) -> Self {
        self.signature = Some(signature);
        self
    }
}

fn or_dash(value: Option<&str>) -> &str {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => "-",
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn join_or_dash(values: &[String]) -> String {
    if values.is_empty() {
        "-".into()
    } else {
        values.join(", ")
    }
}

impl std::fmt::Display for AppInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let app_name = self
            .main_app
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        writeln!(f, "App info:")?;
        writeln!(f, "  Main app                    : {}", app_name)?;
        writeln!(
            f,
            "  Bundle identifier           : {}",
            or_dash(self.identifier.as_deref())
        )?;
        writeln!(
            f,
            "  Display name                : {}",
            or_dash(self.display_name.as_deref())
        )?;
        writeln!(
            f,
            "  Version                     : {}",
            or_dash(self.version.as_deref())
        )?;
        writeln!(
            f,
            "  Build                       : {}",
            or_dash(self.build.as_deref())
        )?;
        writeln!(
            f,
            "  Minimum OS version          : {}",
            or_dash(self.min_os_version.as_deref())
        )?;
        writeln!(
            f,
            "  URL schemes                 : {}",
            join_or_dash(&self.url_schemes)
        )?;
        writeln!(
            f,
            "  Embedded profile            : {}",
            yes_no(self.has_embedded_profile)
        )?;

        if let Some(sig) = &self.signature {
            writeln!(f, "  Signed                      : {}", yes_no(sig.signed))?;
            writeln!(
                f,
                "  Signature identifier        : {}",
                or_dash(sig.identifier.as_deref())
            )?;
            writeln!(
                f,
                "  Signature team id           : {}",
                or_dash(sig.team_id.as_deref())
            )?;
            writeln!(
                f,
                "  Signature authority         : {}",
                join_or_dash(&sig.authorities)
            )?;
            if let Some(error) = &sig.error {
                writeln!(f, "  Signature note              : {}", error)?;
            }
        }

        writeln!(f, "Bundles:")?;
        for bundle in &self.bundles {
            write!(
                f,
                "  {} [{}] {}",
                display_relative(&bundle.path, &self.main_app),
                bundle
                    .package_type
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "unknown".into()),
                bundle.identifier.as_deref().unwrap_or("<no identifier>")
            )?;
            if bundle.has_embedded_profile {
                write!(f, " (embedded profile)")?;
            }
            writeln!(f)?;
        }

        write!(f, "Signing order:")?;
        for (i, step) in self.plan.steps().iter().enumerate() {
            write!(
                f,
                "\n  {}. {} ({})",
                i + 1,
                display_relative(&step.path, &self.main_app),
                step.kind
            )?;
        }

        Ok(())
    }
}
