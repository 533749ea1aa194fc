// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bundle identifier remapping.
//!
//! A single change to the main application's identifier propagates to every
//! nested bundle whose identifier is scoped under it. `com.old.app.share`
//! becomes `com.new.app.share` when `com.old.app` becomes `com.new.app`.
//! Bundles with unrelated identifiers are never touched.

use {
    ipa_bundles::read_manifest_identifier,
    log::{debug, info},
    std::{
        collections::BTreeMap,
        path::{Path, PathBuf},
    },
};

/// Compute the new identifier of a bundle.
///
/// This is a pure string prefix substitution evaluated independently for
/// each bundle. An empty `new_main_id` disables remapping.
pub fn map_identifier(old_id: &str, old_main_id: &str, new_main_id: &str) -> String {
    if new_main_id.is_empty() {
        return old_id.to_string();
    }

    if old_id == old_main_id {
        return new_main_id.to_string();
    }

    match old_id.strip_prefix(old_main_id) {
        Some(suffix) if suffix.starts_with('.') => format!("{}{}", new_main_id, suffix),
        _ => old_id.to_string(),
    }
}

/// The old and new identifier of a single bundle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IdentifierMapping {
    pub old: String,
    pub new: String,
}

impl IdentifierMapping {
    /// Construct an instance by applying [map_identifier()].
    pub fn new(old_id: impl ToString, old_main_id: &str, new_main_id: &str) -> Self {
        let old = old_id.to_string();
        let new = map_identifier(&old, old_main_id, new_main_id);

        Self { old, new }
    }

    /// Whether the identifier is changing.
    pub fn changed(&self) -> bool {
        self.old != self.new
    }
}

impl std::fmt::Display for IdentifierMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.old, self.new)
    }
}

/// Compute identifier mappings for a set of bundles.
///
/// Each bundle's manifest is read. Bundles without a readable, non-empty
/// identifier are omitted: they are still signed but don't participate in
/// remapping or entitlements validation.
pub fn collect_identifier_mappings(
    bundles: &[PathBuf],
    old_main_id: &str,
    new_main_id: &str,
) -> BTreeMap<PathBuf, IdentifierMapping> {
    let mut res = BTreeMap::new();

    for bundle in bundles {
        if let Some(mapping) = mapping_for_bundle(bundle, old_main_id, new_main_id) {
            res.insert(bundle.clone(), mapping);
        }
    }

    res
}

fn mapping_for_bundle(
    bundle: &Path,
    old_main_id: &str,
    new_main_id: &str,
) -> Option<IdentifierMapping> {
    let Some(old_id) = read_manifest_identifier(bundle) else {
        debug!(
            "{} has no readable identifier; leaving it unmapped",
            bundle.display()
        );
        return None;
    };

    let mapping = IdentifierMapping::new(old_id, old_main_id, new_main_id);
    if mapping.changed() {
        info!("{}: {}", bundle.display(), mapping);
    }

    Some(mapping)
}

#[cfg(test)]
mod test {
    use {super::*, std::fs::create_dir_all};

    #[test]
    fn disabled_when_new_main_empty() {
        for (old, main) in [
            ("com.old.app", "com.old.app"),
            ("com.old.app.share", "com.old.app"),
            ("com.other", "com.old.app"),
            ("", ""),
        ] {
            assert_eq!(map_identifier(old, main, ""), old);
        }
    }

    #[test]
    fn main_and_prefix() {
        assert_eq!(
            map_identifier("com.old.app", "com.old.app", "com.new.app"),
            "com.new.app"
        );
        assert_eq!(
            map_identifier("com.old.app.share", "com.old.app", "com.new.app"),
            "com.new.app.share"
        );
        assert_eq!(
            map_identifier("com.old.app.share.deep", "com.old.app", "com.new"),
            "com.new.share.deep"
        );
    }

    #[test]
    fn unrelated_untouched() {
        assert_eq!(
            map_identifier("com.other.app", "com.old.app", "com.new.app"),
            "com.other.app"
        );
        // Sharing a prefix without the separator is not a relationship.
        assert_eq!(
            map_identifier("com.old.apple", "com.old.app", "com.new.app"),
            "com.old.apple"
        );
        assert_eq!(
            map_identifier("prefix.com.old.app", "com.old.app", "com.new.app"),
            "prefix.com.old.app"
        );
    }

    #[test]
    fn mapping_changed() {
        let m = IdentifierMapping::new("com.old.app.share", "com.old.app", "com.new.app");
        assert!(m.changed());
        assert_eq!(format!("{}", m), "com.old.app.share -> com.new.app.share");

        let m = IdentifierMapping::new("com.other", "com.old.app", "com.new.app");
        assert!(!m.changed());
    }

    #[test]
    fn collect_skips_unreadable() -> Result<(), Box<dyn std::error::Error>> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("Main.app");
        let appex = app.join("PlugIns").join("Share.appex");
        let bare = app.join("PlugIns").join("Bare.appex");
        create_dir_all(&appex)?;
        create_dir_all(&bare)?;

        for (dir, id) in [(&app, "com.old.app"), (&appex, "com.old.app.share")] {
            let mut d = plist::Dictionary::new();
            d.insert("CFBundleIdentifier".into(), plist::Value::String(id.into()));
            plist::Value::Dictionary(d).to_file_xml(dir.join("Info.plist"))?;
        }

        let mappings = collect_identifier_mappings(
            &[app.clone(), appex.clone(), bare.clone()],
            "com.old.app",
            "com.new.app",
        );

        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[&app].new, "com.new.app");
        assert_eq!(mappings[&appex].new, "com.new.app.share");
        assert!(!mappings.contains_key(&bare));

        Ok(())
    }
}
