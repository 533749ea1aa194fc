// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Primitives for nested iOS application bundles.

An iOS application (`Payload/MyApp.app` inside an `.ipa`) is a tree of
bundles: the main application can embed app extensions (`.appex` directories
in `PlugIns/`), companion applications (`.app` directories below `Watch/`),
XPC services (`.xpc` directories in `XPCServices/`) and frameworks. Each
signable bundle carries its own `Info.plist` declaring a `CFBundleIdentifier`.

This crate discovers those bundles. [DirectoryBundle] reads a single bundle's
manifest. [scan_bundles()] enumerates every signable bundle under a main
application. [BundleTree] records the containment relationships a signer needs
to process nested content before its container. [find_main_app()] locates the
main application under a `Payload/` directory.
*/

mod directory_bundle;
pub use directory_bundle::*;
mod scan;
pub use scan::*;
mod tree;
pub use tree::*;

/// Directory name suffix of application bundles.
pub const APP_SUFFIX: &str = ".app";

/// Directory name suffix of application extension bundles.
pub const EXTENSION_SUFFIX: &str = ".appex";

/// Directory name suffix of XPC service bundles.
pub const SERVICE_SUFFIX: &str = ".xpc";

/// Describes the type of a signable bundle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BundlePackageType {
    /// An application bundle (`.app`, `APPL`).
    App,
    /// An application extension (`.appex`).
    Extension,
    /// An XPC service (`.xpc`, `XPC!`).
    Service,
}

impl BundlePackageType {
    /// Resolve the package type from a directory name suffix.
    pub fn from_directory_name(name: &str) -> Option<Self> {
        if name.ends_with(APP_SUFFIX) {
            Some(Self::App)
        } else if name.ends_with(EXTENSION_SUFFIX) {
            Some(Self::Extension)
        } else if name.ends_with(SERVICE_SUFFIX) {
            Some(Self::Service)
        } else {
            None
        }
    }

    /// Resolve the package type from a `CFBundlePackageType` value.
    ///
    /// Extensions declare `XPC!` just like XPC services. So this can only
    /// ever resolve [Self::App] or [Self::Service].
    pub fn from_package_type_field(value: &str) -> Option<Self> {
        match value {
            "APPL" => Some(Self::App),
            "XPC!" => Some(Self::Service),
            _ => None,
        }
    }
}

impl std::fmt::Display for BundlePackageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::App => "application",
            Self::Extension => "extension",
            Self::Service => "service",
        })
    }
}

/// Whether a directory name denotes a signable bundle.
pub fn is_signable_bundle_name(name: &str) -> bool {
    BundlePackageType::from_directory_name(name).is_some()
}
