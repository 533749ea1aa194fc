// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bundles backed by a directory.

use {
    crate::BundlePackageType,
    anyhow::{anyhow, Context, Result},
    log::debug,
    std::path::{Path, PathBuf},
};

/// A signable bundle backed by a filesystem directory.
///
/// iOS bundles are shallow: the `Info.plist` lives at the root of the bundle
/// directory. A `Contents/Info.plist` layout is also recognized so macOS style
/// bundles embedded in an application can be inspected.
#[derive(Clone, Debug)]
pub struct DirectoryBundle {
    /// Root directory of this bundle.
    root: PathBuf,

    /// Name of the root directory.
    root_name: String,

    /// Whether the bundle is shallow.
    ///
    /// If false, content is in a `Contents/` sub-directory.
    shallow: bool,

    /// The type of this bundle.
    package_type: BundlePackageType,

    /// Parsed `Info.plist` file.
    info_plist: plist::Dictionary,
}

impl DirectoryBundle {
    /// Open an existing bundle from a filesystem path.
    ///
    /// Errors if the directory doesn't exist, lacks an `Info.plist`, the
    /// `Info.plist` isn't a dictionary, or the package type can't be resolved
    /// from either the directory suffix or `CFBundlePackageType`.
    pub fn new_from_path(directory: &Path) -> Result<Self> {
        if !directory.is_dir() {
            return Err(anyhow!("{} is not a directory", directory.display()));
        }

        let root_name = directory
            .file_name()
            .ok_or_else(|| anyhow!("unable to resolve root directory name"))?
            .to_string_lossy()
            .to_string();

        let contents_plist = directory.join("Contents").join("Info.plist");
        let shallow = !contents_plist.is_file();

        let info_plist_path = if shallow {
            directory.join("Info.plist")
        } else {
            contents_plist
        };

        if !info_plist_path.is_file() {
            return Err(anyhow!(
                "Info.plist not found in {}; not a valid bundle",
                directory.display()
            ));
        }

        let info_plist_data = std::fs::read(&info_plist_path)?;
        let cursor = std::io::Cursor::new(info_plist_data);
        let value = plist::Value::from_reader(cursor)
            .with_context(|| format!("parsing {}", info_plist_path.display()))?;
        let info_plist = value
            .into_dictionary()
            .ok_or_else(|| anyhow!("{} is not a dictionary", info_plist_path.display()))?;

        let package_type = match BundlePackageType::from_directory_name(&root_name) {
            Some(pt) => pt,
            None => info_plist
                .get("CFBundlePackageType")
                .and_then(|v| v.as_string())
                .and_then(BundlePackageType::from_package_type_field)
                .ok_or_else(|| {
                    anyhow!(
                        "unable to determine package type of {}",
                        directory.display()
                    )
                })?,
        };

        Ok(Self {
            root: directory.to_path_buf(),
            root_name,
            shallow,
            package_type,
            info_plist,
        })
    }

    /// Resolve the absolute path to a file in the bundle.
    pub fn resolve_path(&self, path: impl AsRef<Path>) -> PathBuf {
        if self.shallow {
            self.root.join(path.as_ref())
        } else {
            self.root.join("Contents").join(path.as_ref())
        }
    }

    /// The root directory of this bundle.
    pub fn root_dir(&self) -> &Path {
        &self.root
    }

    /// The on-disk name of this bundle, including its suffix.
    pub fn name(&self) -> &str {
        &self.root_name
    }

    /// Obtain the path to the `Info.plist` file.
    pub fn info_plist_path(&self) -> PathBuf {
        self.resolve_path("Info.plist")
    }

    /// Obtain the parsed `Info.plist` file.
    pub fn info_plist(&self) -> &plist::Dictionary {
        &self.info_plist
    }

    /// Obtain a mutable reference to the parsed `Info.plist`.
    ///
    /// Changes are not persisted until [Self::write_info_plist()] is called.
    pub fn info_plist_mut(&mut self) -> &mut plist::Dictionary {
        &mut self.info_plist
    }

    /// Write the in-memory `Info.plist` back to disk in binary form.
    pub fn write_info_plist(&self) -> Result<()> {
        let path = self.info_plist_path();
        debug!("writing {}", path.display());

        plist::Value::Dictionary(self.info_plist.clone())
            .to_file_binary(&path)
            .with_context(|| format!("writing {}", path.display()))
    }

    /// Obtain an `Info.plist` key as a `String`.
    ///
    /// Will return `None` if the specified key doesn't exist. Errors if the key value
    /// is not a string.
    pub fn info_plist_key_string(&self, key: &str) -> Result<Option<String>> {
        if let Some(value) = self.info_plist.get(key) {
            Ok(Some(
                value
                    .as_string()
                    .ok_or_else(|| anyhow!("key {} is not a string", key))?
                    .to_string(),
            ))
        } else {
            Ok(None)
        }
    }

    /// Obtain the type of bundle.
    pub fn package_type(&self) -> BundlePackageType {
        self.package_type
    }

    /// Obtain the bundle identifier.
    ///
    /// This retrieves `CFBundleIdentifier` from the `Info.plist`.
    pub fn identifier(&self) -> Result<Option<String>> {
        self.info_plist_key_string("CFBundleIdentifier")
    }

    /// Obtain the raw `CFBundlePackageType` value.
    pub fn package_type_field(&self) -> Result<Option<String>> {
        self.info_plist_key_string("CFBundlePackageType")
    }

    /// Obtain the bundle display name (`CFBundleDisplayName`).
    pub fn display_name(&self) -> Result<Option<String>> {
        self.info_plist_key_string("CFBundleDisplayName")
    }

    /// Obtain the bundle version string (`CFBundleVersion`).
    pub fn version(&self) -> Result<Option<String>> {
        self.info_plist_key_string("CFBundleVersion")
    }

    /// Obtain the user facing version (`CFBundleShortVersionString`).
    pub fn short_version(&self) -> Result<Option<String>> {
        self.info_plist_key_string("CFBundleShortVersionString")
    }

    /// Obtain the minimum OS version the bundle runs on (`MinimumOSVersion`).
    pub fn minimum_os_version(&self) -> Result<Option<String>> {
        self.info_plist_key_string("MinimumOSVersion")
    }

    /// Whether a provisioning profile is embedded in this bundle.
    pub fn has_embedded_profile(&self) -> bool {
        self.resolve_path("embedded.mobileprovision").is_file()
    }
}

/// Read the declared identifier of the bundle at `path`.
///
/// Returns `None` if the bundle can't be opened, has no `CFBundleIdentifier`,
/// or the identifier is not a non-empty string.
pub fn read_manifest_identifier(path: &Path) -> Option<String> {
    let bundle = match DirectoryBundle::new_from_path(path) {
        Ok(bundle) => bundle,
        Err(e) => {
            debug!("unable to read manifest of {}: {:#}", path.display(), e);
            return None;
        }
    };

    match bundle.identifier() {
        Ok(Some(id)) if !id.is_empty() => Some(id),
        _ => None,
    }
}
