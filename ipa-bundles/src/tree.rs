// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Containment tree of a main application and its embedded components.

use {
    crate::{APP_SUFFIX, EXTENSION_SUFFIX, SERVICE_SUFFIX},
    anyhow::{anyhow, Result},
    log::debug,
    std::path::{Path, PathBuf},
};

/// Name of the directory holding app extensions.
pub const PLUGINS_DIR: &str = "PlugIns";

/// Name of the directory holding companion (watch) applications.
pub const WATCH_DIR: &str = "Watch";

/// Name of the directory holding frameworks and dynamic libraries.
pub const FRAMEWORKS_DIR: &str = "Frameworks";

/// Name of the directory holding XPC services.
pub const XPC_SERVICES_DIR: &str = "XPCServices";

/// A bundle and the signable components embedded in it.
///
/// Only conventional locations are considered: `PlugIns/*.appex`,
/// `.app` directories anywhere below `Watch/`, `Frameworks/*.framework`,
/// `Frameworks/*.dylib`, `Frameworks/*.so` and `XPCServices/*.xpc`.
/// Each list is sorted by file name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BundleNode {
    path: PathBuf,
    plugins: Vec<BundleNode>,
    watch_apps: Vec<BundleNode>,
    frameworks: Vec<PathBuf>,
    libraries: Vec<PathBuf>,
    xpc_services: Vec<BundleNode>,
}

impl BundleNode {
    fn from_path(path: PathBuf) -> Self {
        let plugins = list_children(&path.join(PLUGINS_DIR), |p, name| {
            p.is_dir() && name.ends_with(EXTENSION_SUFFIX)
        })
        .into_iter()
        .map(Self::from_path)
        .collect();

        let watch_apps = find_watch_apps(&path.join(WATCH_DIR))
            .into_iter()
            .map(Self::from_path)
            .collect();

        let frameworks_dir = path.join(FRAMEWORKS_DIR);
        let frameworks = list_children(&frameworks_dir, |p, name| {
            p.is_dir() && name.ends_with(".framework")
        });
        let libraries = list_children(&frameworks_dir, |p, name| {
            p.is_file() && (name.ends_with(".dylib") || name.ends_with(".so"))
        });

        let xpc_services = list_children(&path.join(XPC_SERVICES_DIR), |p, name| {
            p.is_dir() && name.ends_with(SERVICE_SUFFIX)
        })
        .into_iter()
        .map(Self::from_path)
        .collect();

        Self {
            path,
            plugins,
            watch_apps,
            frameworks,
            libraries,
            xpc_services,
        }
    }

    /// Filesystem path of this bundle.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// App extensions in `PlugIns/`.
    pub fn plugins(&self) -> &[BundleNode] {
        &self.plugins
    }

    /// Companion applications under `Watch/`.
    pub fn watch_apps(&self) -> &[BundleNode] {
        &self.watch_apps
    }

    /// Framework directories in `Frameworks/`.
    pub fn frameworks(&self) -> &[PathBuf] {
        &self.frameworks
    }

    /// Dynamic library files in `Frameworks/`.
    pub fn libraries(&self) -> &[PathBuf] {
        &self.libraries
    }

    /// XPC services in `XPCServices/`.
    pub fn xpc_services(&self) -> &[BundleNode] {
        &self.xpc_services
    }

    /// All nested bundle nodes, in the order a signer should descend into them.
    pub fn nested_bundles(&self) -> impl Iterator<Item = &BundleNode> {
        self.plugins
            .iter()
            .chain(self.watch_apps.iter())
            .chain(self.xpc_services.iter())
    }
}

/// The containment tree rooted at a main application.
///
/// The tree is built once from the filesystem. Consumers walk it without
/// touching the filesystem again, so the traversal is independent of
/// directory listing order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BundleTree {
    root: BundleNode,
}

impl BundleTree {
    /// Build the tree for the application bundle at `root`.
    pub fn from_root(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();

        if !root.is_dir() {
            return Err(anyhow!("{} is not a directory", root.display()));
        }

        Ok(Self {
            root: BundleNode::from_path(root.to_path_buf()),
        })
    }

    /// The root (main application) node.
    pub fn root(&self) -> &BundleNode {
        &self.root
    }

    /// Total number of bundle nodes, including the root.
    pub fn bundle_count(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![&self.root];

        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(node.nested_bundles());
        }

        count
    }
}

/// List immediate children of `dir` matching `filter`, sorted by name.
///
/// A missing or unreadable directory yields nothing.
fn list_children(dir: &Path, filter: impl Fn(&Path, &str) -> bool) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return vec![],
    };

    let mut res = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .map(|name| filter(path, &name.to_string_lossy()))
                .unwrap_or(false)
        })
        .collect::<Vec<_>>();
    res.sort();

    res
}

/// Find `.app` directories anywhere below `dir`.
///
/// Wrapper directories are traversed. Found applications are not descended
/// into since their content belongs to their own node.
fn find_watch_apps(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return vec![];
    }

    let mut res = vec![];
    let mut walker = walkdir::WalkDir::new(dir)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("ignoring unreadable path under {}: {}", dir.display(), e);
                continue;
            }
        };

        if entry.file_type().is_dir() && entry.file_name().to_string_lossy().ends_with(APP_SUFFIX)
        {
            res.push(entry.into_path());
            walker.skip_current_dir();
        }
    }

    res
}
