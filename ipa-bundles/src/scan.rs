// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Discovery of bundles on the filesystem.

use {
    crate::{is_signable_bundle_name, DirectoryBundle, APP_SUFFIX},
    anyhow::{anyhow, Result},
    log::debug,
    std::path::{Path, PathBuf},
};

/// Enumerate every signable bundle under a main application.
///
/// Returns `root` followed by all directories beneath it whose names end in
/// `.app`, `.appex` or `.xpc`, ordered by ascending path length. Ties retain
/// the (file name sorted) walk order, so output is deterministic.
///
/// The ordering is for presentation only. It roughly puts shallow bundles
/// before deep ones but carries no signing order guarantees: see
/// [crate::BundleTree] for that.
///
/// Directories that can't be read are logged and treated as having no
/// content.
pub fn scan_bundles(root: impl AsRef<Path>) -> Vec<PathBuf> {
    let root = root.as_ref();

    let mut nested = walkdir::WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("ignoring unreadable path during bundle scan: {}", e);
                None
            }
        })
        .filter(|entry| {
            entry.file_type().is_dir()
                && is_signable_bundle_name(&entry.file_name().to_string_lossy())
        })
        .map(|entry| entry.into_path())
        .collect::<Vec<_>>();

    nested.sort_by_key(|p| p.as_os_str().len());

    let mut bundles = Vec::with_capacity(nested.len() + 1);
    bundles.push(root.to_path_buf());
    bundles.extend(nested);

    bundles
}

/// Locate the main application bundle in a `Payload/` directory.
///
/// `name` selects an application by directory name. A missing `.app`
/// suffix is added. Without a name, the only `.app` is chosen. If there are
/// several, the only one declaring `CFBundlePackageType = APPL` is chosen.
/// Anything else is an error listing the candidates.
pub fn find_main_app(payload: impl AsRef<Path>, name: Option<&str>) -> Result<PathBuf> {
    let payload = payload.as_ref();

    let mut apps = vec![];
    for entry in std::fs::read_dir(payload)
        .map_err(|e| anyhow!("unable to read {}: {}", payload.display(), e))?
    {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() && entry.file_name().to_string_lossy().ends_with(APP_SUFFIX) {
            apps.push(path);
        }
    }
    apps.sort();

    if apps.is_empty() {
        return Err(anyhow!("no .app found under {}", payload.display()));
    }

    let available = || {
        apps.iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };

    if let Some(name) = name {
        let raw = Path::new(name.trim())
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let target = if raw.ends_with(APP_SUFFIX) {
            raw
        } else {
            format!("{}{}", raw, APP_SUFFIX)
        };

        return apps
            .iter()
            .find(|p| p.file_name().map(|n| n.to_string_lossy() == target) == Some(true))
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "main app not found: {}; available under Payload/: {}",
                    target,
                    available()
                )
            });
    }

    if apps.len() == 1 {
        return Ok(apps[0].clone());
    }

    let appl = apps
        .iter()
        .filter(|p| {
            DirectoryBundle::new_from_path(p)
                .ok()
                .and_then(|b| b.package_type_field().ok().flatten())
                .as_deref()
                == Some("APPL")
        })
        .collect::<Vec<_>>();

    if appl.len() == 1 {
        Ok(appl[0].clone())
    } else {
        Err(anyhow!(
            "multiple .app found under Payload/; specify the main app name; available: {}",
            available()
        ))
    }
}

#[cfg(test)]
mod test {
    use {super::*, std::fs::create_dir_all};

    fn write_package_type(dir: &Path, package_type: &str) -> Result<()> {
        let mut d = plist::Dictionary::new();
        d.insert(
            "CFBundlePackageType".into(),
            plist::Value::String(package_type.into()),
        );
        plist::Value::Dictionary(d).to_file_xml(dir.join("Info.plist"))?;

        Ok(())
    }

    #[test]
    fn scan_root_first_then_by_length() -> Result<()> {
        let td = tempfile::tempdir()?;

        let app = td.path().join("Main.app");
        let appex = app.join("PlugIns").join("Share.appex");
        let nested = appex.join("Nested.app");
        let xpc = app.join("XPCServices").join("A.xpc");
        let framework = app.join("Frameworks").join("Core.framework");
        create_dir_all(&nested)?;
        create_dir_all(&xpc)?;
        create_dir_all(&framework)?;

        let bundles = scan_bundles(&app);

        assert_eq!(bundles[0], app);
        assert_eq!(bundles.len(), 4);
        assert!(bundles.contains(&appex));
        assert!(bundles.contains(&nested));
        assert!(bundles.contains(&xpc));
        assert!(!bundles.contains(&framework));

        let lengths = bundles[1..]
            .iter()
            .map(|p| p.as_os_str().len())
            .collect::<Vec<_>>();
        let mut sorted = lengths.clone();
        sorted.sort();
        assert_eq!(lengths, sorted);

        Ok(())
    }

    #[test]
    fn scan_missing_root() {
        let bundles = scan_bundles("/nonexistent/path/Main.app");
        assert_eq!(bundles, vec![PathBuf::from("/nonexistent/path/Main.app")]);
    }

    #[test]
    fn scan_ignores_files_with_bundle_suffix() -> Result<()> {
        let td = tempfile::tempdir()?;

        let app = td.path().join("Main.app");
        create_dir_all(&app)?;
        std::fs::write(app.join("decoy.appex"), b"")?;

        assert_eq!(scan_bundles(&app), vec![app]);

        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn scan_skips_unreadable_directory() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let td = tempfile::tempdir()?;

        let app = td.path().join("Main.app");
        let appex = app.join("PlugIns").join("Share.appex");
        let locked = app.join("Locked");
        let hidden = locked.join("Hidden.appex");
        let xpc = app.join("XPCServices").join("A.xpc");
        create_dir_all(&appex)?;
        create_dir_all(&hidden)?;
        create_dir_all(&xpc)?;

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000))?;
        // Permission bits don't apply to privileged users.
        let readable = std::fs::read_dir(&locked).is_ok();

        let bundles = scan_bundles(&app);

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755))?;

        assert_eq!(bundles[0], app);
        assert!(bundles.contains(&appex));
        assert!(bundles.contains(&xpc));
        assert_eq!(bundles.contains(&hidden), readable);
        assert_eq!(bundles.len(), if readable { 4 } else { 3 });

        Ok(())
    }

    #[test]
    fn main_app_single() -> Result<()> {
        let td = tempfile::tempdir()?;
        let payload = td.path().join("Payload");
        create_dir_all(payload.join("Main.app"))?;
        std::fs::write(payload.join("stray.txt"), b"")?;

        assert_eq!(find_main_app(&payload, None)?, payload.join("Main.app"));

        Ok(())
    }

    #[test]
    fn main_app_by_name() -> Result<()> {
        let td = tempfile::tempdir()?;
        let payload = td.path().join("Payload");
        create_dir_all(payload.join("A.app"))?;
        create_dir_all(payload.join("B.app"))?;

        assert_eq!(find_main_app(&payload, Some("B"))?, payload.join("B.app"));
        assert_eq!(
            find_main_app(&payload, Some("A.app"))?,
            payload.join("A.app")
        );

        let err = find_main_app(&payload, Some("C.app")).unwrap_err();
        assert!(format!("{}", err).contains("main app not found: C.app"));
        assert!(format!("{}", err).contains("A.app, B.app"));

        Ok(())
    }

    #[test]
    fn main_app_disambiguated_by_package_type() -> Result<()> {
        let td = tempfile::tempdir()?;
        let payload = td.path().join("Payload");
        let a = payload.join("A.app");
        let b = payload.join("B.app");
        create_dir_all(&a)?;
        create_dir_all(&b)?;

        assert!(find_main_app(&payload, None).is_err());

        write_package_type(&a, "BNDL")?;
        write_package_type(&b, "APPL")?;
        assert_eq!(find_main_app(&payload, None)?, b);

        write_package_type(&a, "APPL")?;
        let err = find_main_app(&payload, None).unwrap_err();
        assert!(format!("{}", err).contains("multiple .app found"));

        Ok(())
    }

    #[test]
    fn main_app_none() -> Result<()> {
        let td = tempfile::tempdir()?;
        let payload = td.path().join("Payload");
        create_dir_all(&payload)?;

        assert!(find_main_app(&payload, None).is_err());

        Ok(())
    }
}
