// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Functionality for signing nested bundle trees.

use {
    crate::{
        entitlements::EntitlementsMap, error::ResignError, settings::ResignSettings,
        signing_service::SigningService,
    },
    ipa_bundles::{BundleNode, BundleTree},
    log::{log, Level},
    std::path::{Path, PathBuf},
};

/// The kind of artifact a [SigningStep] signs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SigningStepKind {
    /// A `.framework` directory. Signed without entitlements.
    Framework,
    /// A `.dylib` or `.so` file. Signed without entitlements.
    Library,
    /// An application, extension or XPC service bundle.
    Bundle,
}

impl std::fmt::Display for SigningStepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Framework => "framework",
            Self::Library => "library",
            Self::Bundle => "bundle",
        })
    }
}

/// A single signing operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SigningStep {
    pub path: PathBuf,
    pub kind: SigningStepKind,
}

enum Frame<'a> {
    Enter(&'a BundleNode),
    Components(&'a BundleNode),
    Bundle(&'a BundleNode),
}

/// The ordered signing operations for a bundle tree.
///
/// Within each bundle, extensions are handled first, then companion
/// applications, then frameworks and libraries, then XPC services, and finally
/// the bundle itself. Nested bundles are fully processed before moving on, so
/// every component appears before the bundle containing it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SigningPlan {
    steps: Vec<SigningStep>,
}

impl SigningPlan {
    /// Compute the plan for a tree.
    pub fn from_tree(tree: &BundleTree) -> Self {
        let mut steps = vec![];
        let mut stack = vec![Frame::Enter(tree.root())];

        while let Some(frame) = stack.pop() {
            match frame {
                // Pushed in reverse so they pop in processing order.
                Frame::Enter(node) => {
                    stack.push(Frame::Bundle(node));
                    stack.extend(node.xpc_services().iter().rev().map(Frame::Enter));
                    stack.push(Frame::Components(node));
                    stack.extend(node.watch_apps().iter().rev().map(Frame::Enter));
                    stack.extend(node.plugins().iter().rev().map(Frame::Enter));
                }
                Frame::Components(node) => {
                    steps.extend(node.frameworks().iter().map(|p| SigningStep {
                        path: p.clone(),
                        kind: SigningStepKind::Framework,
                    }));
                    steps.extend(node.libraries().iter().map(|p| SigningStep {
                        path: p.clone(),
                        kind: SigningStepKind::Library,
                    }));
                }
                Frame::Bundle(node) => {
                    steps.push(SigningStep {
                        path: node.path().to_path_buf(),
                        kind: SigningStepKind::Bundle,
                    });
                }
            }
        }

        Self { steps }
    }

    /// The steps, in execution order.
    pub fn steps(&self) -> &[SigningStep] {
        &self.steps
    }

    /// Paths signed by this plan, in execution order.
    pub fn paths(&self) -> impl Iterator<Item = &Path> {
        self.steps.iter().map(|s| s.path.as_path())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// A primitive for re-signing a nested bundle tree.
///
/// Every signable artifact has its existing signature removed and is signed
/// again. Bundles are signed with the entitlements resolved for their exact
/// path, if any. Frameworks and libraries never get entitlements.
///
/// Signing stops at the first failure. Once everything is signed, the root
/// bundle's signature is strictly verified, which covers all nested content.
pub struct BundleSigner {
    tree: BundleTree,
}

impl BundleSigner {
    /// Construct an instance for the main application at `path`.
    pub fn new_from_path(path: impl AsRef<Path>) -> Result<Self, ResignError> {
        let tree = BundleTree::from_root(path).map_err(ResignError::DirectoryBundle)?;

        Ok(Self { tree })
    }

    /// Construct an instance from an existing tree.
    pub fn new_from_tree(tree: BundleTree) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &BundleTree {
        &self.tree
    }

    /// The operations [Self::sign_tree()] will perform.
    pub fn plan(&self) -> SigningPlan {
        SigningPlan::from_tree(&self.tree)
    }

    /// Sign every artifact in the tree, then verify the root.
    pub fn sign_tree(
        &self,
        settings: &ResignSettings,
        entitlements: &EntitlementsMap,
        service: &dyn SigningService,
    ) -> Result<(), ResignError> {
        let identity = settings
            .signing_identity()
            .ok_or(ResignError::NoSigningIdentity)?;

        let level = if settings.verbose() {
            Level::Warn
        } else {
            Level::Info
        };

        let plan = self.plan();

        log!(
            level,
            "signing {} artifacts under {}",
            plan.len(),
            self.tree.root().path().display()
        );

        for step in plan.steps() {
            self.sign_step(step, identity, entitlements, service, level)?;
        }

        let root = self.tree.root().path();
        log!(level, "verifying {}", root.display());
        service.verify_strict(root)?;

        Ok(())
    }

    fn sign_step(
        &self,
        step: &SigningStep,
        identity: &str,
        entitlements: &EntitlementsMap,
        service: &dyn SigningService,
        level: Level,
    ) -> Result<(), ResignError> {
        service.remove_signature(&step.path);

        match step.kind {
            SigningStepKind::Framework | SigningStepKind::Library => {
                log!(level, "signing {} {}", step.kind, step.path.display());
                service.sign(&step.path, identity, None)
            }
            SigningStepKind::Bundle => {
                let file = entitlements
                    .get(&step.path)
                    .and_then(|e| e.as_ref())
                    .map(|e| service.write_entitlements_file(e))
                    .transpose()?;

                log!(
                    level,
                    "signing {}{}",
                    step.path.display(),
                    if file.is_some() {
                        ""
                    } else {
                        " (no entitlements)"
                    }
                );

                // The file is deleted when dropped at the end of this scope,
                // whether or not signing succeeded.
                service.sign(&step.path, identity, file.as_ref().map(|f| f.path()))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::identifier::collect_identifier_mappings,
        plist::{Dictionary, Value},
        std::{cell::RefCell, fs::create_dir_all},
    };

    #[derive(Clone, Debug, PartialEq)]
    enum Event {
        Remove(PathBuf),
        Sign {
            path: PathBuf,
            entitlements_file: Option<PathBuf>,
            entitlements: Option<Dictionary>,
        },
        Verify(PathBuf),
    }

    #[derive(Default)]
    struct RecordingService {
        events: RefCell<Vec<Event>>,
        fail_sign: Option<PathBuf>,
    }

    impl RecordingService {
        fn signed_paths(&self) -> Vec<PathBuf> {
            self.events
                .borrow()
                .iter()
                .filter_map(|e| match e {
                    Event::Sign { path, .. } => Some(path.clone()),
                    _ => None,
                })
                .collect()
        }

        fn sign_event(&self, wanted: &Path) -> Event {
            self.events
                .borrow()
                .iter()
                .find(|e| matches!(e, Event::Sign { path, .. } if path == wanted))
                .cloned()
                .unwrap()
        }
    }

    impl SigningService for RecordingService {
        fn remove_signature(&self, path: &Path) {
            self.events
                .borrow_mut()
                .push(Event::Remove(path.to_path_buf()));
        }

        fn sign(
            &self,
            path: &Path,
            _identity: &str,
            entitlements: Option<&Path>,
        ) -> Result<(), ResignError> {
            // Read back the file while it must still exist.
            let content = entitlements
                .map(|p| Value::from_file(p).map(|v| v.into_dictionary().unwrap()))
                .transpose()?;

            self.events.borrow_mut().push(Event::Sign {
                path: path.to_path_buf(),
                entitlements_file: entitlements.map(|p| p.to_path_buf()),
                entitlements: content,
            });

            if self.fail_sign.as_deref() == Some(path) {
                Err(ResignError::CodesignFailed {
                    path: path.to_path_buf(),
                    stderr: "boom".into(),
                })
            } else {
                Ok(())
            }
        }

        fn verify_strict(&self, path: &Path) -> Result<(), ResignError> {
            self.events
                .borrow_mut()
                .push(Event::Verify(path.to_path_buf()));
            Ok(())
        }

        fn extract_entitlements(&self, _path: &Path) -> Option<Dictionary> {
            None
        }
    }

    fn app_id(value: &str) -> Dictionary {
        let mut d = Dictionary::new();
        d.insert("application-identifier".into(), value.into());
        d
    }

    fn settings() -> ResignSettings {
        let mut settings = ResignSettings::default();
        settings.set_signing_identity("IDENTITY");
        settings
    }

    struct Fixture {
        _td: tempfile::TempDir,
        app: PathBuf,
        appex: PathBuf,
        appex_framework: PathBuf,
        watch_app: PathBuf,
        framework: PathBuf,
        dylib: PathBuf,
        xpc: PathBuf,
    }

    fn fixture() -> Result<Fixture, Box<dyn std::error::Error>> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("Main.app");
        let appex = app.join("PlugIns").join("Share.appex");
        let appex_framework = appex.join("Frameworks").join("Inner.framework");
        let watch_app = app.join("Watch").join("Watch.app");
        let framework = app.join("Frameworks").join("Core.framework");
        let dylib = app.join("Frameworks").join("libX.dylib");
        let xpc = app.join("XPCServices").join("Agent.xpc");

        for d in [&appex_framework, &watch_app, &framework, &xpc] {
            create_dir_all(d)?;
        }
        std::fs::write(&dylib, b"bin")?;

        Ok(Fixture {
            _td: td,
            app,
            appex,
            appex_framework,
            watch_app,
            framework,
            dylib,
            xpc,
        })
    }

    #[test]
    fn plan_order() -> Result<(), Box<dyn std::error::Error>> {
        let f = fixture()?;
        let signer = BundleSigner::new_from_path(&f.app)?;

        let plan = signer.plan();
        assert_eq!(
            plan.steps(),
            &[
                SigningStep {
                    path: f.appex_framework.clone(),
                    kind: SigningStepKind::Framework
                },
                SigningStep {
                    path: f.appex.clone(),
                    kind: SigningStepKind::Bundle
                },
                SigningStep {
                    path: f.watch_app.clone(),
                    kind: SigningStepKind::Bundle
                },
                SigningStep {
                    path: f.framework.clone(),
                    kind: SigningStepKind::Framework
                },
                SigningStep {
                    path: f.dylib.clone(),
                    kind: SigningStepKind::Library
                },
                SigningStep {
                    path: f.xpc.clone(),
                    kind: SigningStepKind::Bundle
                },
                SigningStep {
                    path: f.app.clone(),
                    kind: SigningStepKind::Bundle
                },
            ]
        );

        Ok(())
    }

    #[test]
    fn contained_before_container() -> Result<(), Box<dyn std::error::Error>> {
        let f = fixture()?;
        let plan = BundleSigner::new_from_path(&f.app)?.plan();
        let paths = plan.paths().collect::<Vec<_>>();

        // Each container appears after everything inside it.
        for (i, a) in paths.iter().enumerate() {
            assert!(paths[i + 1..].iter().all(|b| !b.starts_with(a) || a == b));
        }

        Ok(())
    }

    #[test]
    fn sign_tree_entitlements_and_verify() -> Result<(), Box<dyn std::error::Error>> {
        let f = fixture()?;
        let signer = BundleSigner::new_from_path(&f.app)?;

        let entitlements = EntitlementsMap::from_iter([
            (f.app.clone(), Some(app_id("TEAM.app"))),
            (f.appex.clone(), Some(app_id("TEAM.appex"))),
            (f.xpc.clone(), None),
        ]);

        let service = RecordingService::default();
        signer.sign_tree(&settings(), &entitlements, &service)?;

        let events = service.events.borrow().clone();

        // Every sign is preceded by a signature removal of the same path.
        for (i, e) in events.iter().enumerate() {
            if let Event::Sign { path, .. } = e {
                assert_eq!(events[i - 1], Event::Remove(path.clone()));
            }
        }

        assert_eq!(events.last(), Some(&Event::Verify(f.app.clone())));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, Event::Verify(_)))
                .count(),
            1
        );

        match service.sign_event(&f.app) {
            Event::Sign {
                entitlements_file,
                entitlements,
                ..
            } => {
                assert_eq!(entitlements, Some(app_id("TEAM.app")));
                assert!(!entitlements_file.unwrap().exists());
            }
            _ => unreachable!(),
        }

        for path in [&f.framework, &f.dylib, &f.appex_framework, &f.xpc, &f.watch_app] {
            match service.sign_event(path) {
                Event::Sign {
                    entitlements_file, ..
                } => assert_eq!(entitlements_file, None, "{}", path.display()),
                _ => unreachable!(),
            }
        }

        Ok(())
    }

    #[test]
    fn abort_on_first_failure() -> Result<(), Box<dyn std::error::Error>> {
        let f = fixture()?;
        let signer = BundleSigner::new_from_path(&f.app)?;

        let entitlements =
            EntitlementsMap::from_iter([(f.appex.clone(), Some(app_id("TEAM.appex")))]);

        let service = RecordingService {
            fail_sign: Some(f.appex.clone()),
            ..Default::default()
        };

        let res = signer.sign_tree(&settings(), &entitlements, &service);
        assert!(matches!(res, Err(ResignError::CodesignFailed { .. })));

        assert_eq!(
            service.signed_paths(),
            vec![f.appex_framework.clone(), f.appex.clone()]
        );
        assert!(!service
            .events
            .borrow()
            .iter()
            .any(|e| matches!(e, Event::Verify(_))));

        // The entitlements file is removed on failure too.
        match service.sign_event(&f.appex) {
            Event::Sign {
                entitlements_file, ..
            } => assert!(!entitlements_file.unwrap().exists()),
            _ => unreachable!(),
        }

        Ok(())
    }

    #[test]
    fn missing_identity() -> Result<(), Box<dyn std::error::Error>> {
        let f = fixture()?;
        let signer = BundleSigner::new_from_path(&f.app)?;
        let service = RecordingService::default();

        assert!(matches!(
            signer.sign_tree(&ResignSettings::default(), &EntitlementsMap::new(), &service),
            Err(ResignError::NoSigningIdentity)
        ));
        assert!(service.events.borrow().is_empty());

        Ok(())
    }

    #[test]
    fn main_and_share_extension() -> Result<(), Box<dyn std::error::Error>> {
        let td = tempfile::tempdir()?;
        let app = td.path().join("Main.app");
        let appex = app.join("PlugIns").join("Share.appex");
        create_dir_all(&appex)?;

        for (dir, id) in [(&app, "com.old.app"), (&appex, "com.old.app.share")] {
            let mut d = Dictionary::new();
            d.insert("CFBundleIdentifier".into(), id.into());
            Value::Dictionary(d).to_file_xml(dir.join("Info.plist"))?;
        }

        let mappings = collect_identifier_mappings(
            &[app.clone(), appex.clone()],
            "com.old.app",
            "com.new.app",
        );
        assert_eq!(mappings[&app].new, "com.new.app");
        assert_eq!(mappings[&appex].new, "com.new.app.share");

        let service = RecordingService::default();
        BundleSigner::new_from_path(&app)?.sign_tree(
            &settings(),
            &EntitlementsMap::new(),
            &service,
        )?;

        assert_eq!(service.signed_paths(), vec![appex, app.clone()]);
        assert_eq!(
            service.events.borrow().last(),
            Some(&Event::Verify(app))
        );

        Ok(())
    }

    #[test]
    fn missing_root() {
        assert!(matches!(
            BundleSigner::new_from_path("/nonexistent/Main.app"),
            Err(ResignError::DirectoryBundle(_))
        ));
    }
}
