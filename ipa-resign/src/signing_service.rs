// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interaction with the platform code signing tools.

use {
    crate::{
        error::ResignError,
        inspect::{parse_codesign_display, SignatureInfo},
        profile::{parse_find_identity_output, CodeSigningIdentity},
    },
    log::{debug, log, Level},
    plist::{Dictionary, Value},
    std::{
        ffi::{OsStr, OsString},
        io::{Cursor, Write},
        path::{Path, PathBuf},
        process::{Command, Output},
    },
    tempfile::TempPath,
};

/// Low-level code signing operations on a single path.
///
/// [crate::BundleSigner] drives signing through this trait, which keeps the
/// orchestration independent from the tool that actually signs.
pub trait SigningService {
    /// Remove an existing signature.
    ///
    /// This is best effort: paths without a signature are normal and failures
    /// are ignored.
    fn remove_signature(&self, path: &Path);

    /// Sign a path with an identity and optional entitlements file.
    fn sign(
        &self,
        path: &Path,
        identity: &str,
        entitlements: Option<&Path>,
    ) -> Result<(), ResignError>;

    /// Strictly verify a signature, including everything nested in it.
    fn verify_strict(&self, path: &Path) -> Result<(), ResignError>;

    /// Obtain the entitlements embedded in the current signature of a path.
    ///
    /// Returns `None` if there is no signature, it has no entitlements, or
    /// they can't be read.
    fn extract_entitlements(&self, path: &Path) -> Option<Dictionary>;

    /// Write entitlements to a temporary file for a single signing operation.
    fn write_entitlements_file(
        &self,
        entitlements: &Dictionary,
    ) -> Result<EntitlementsFile, ResignError> {
        EntitlementsFile::write(entitlements)
    }
}

/// A temporary XML plist file holding entitlements.
///
/// The file is deleted when this instance is dropped. Deletion errors are
/// ignored.
#[derive(Debug)]
pub struct EntitlementsFile {
    path: TempPath,
}

impl EntitlementsFile {
    /// Write entitlements to a new temporary file.
    pub fn write(entitlements: &Dictionary) -> Result<Self, ResignError> {
        let mut data = vec![];
        Value::Dictionary(entitlements.clone()).to_writer_xml(&mut data)?;

        let mut file = tempfile::Builder::new()
            .prefix("ents_")
            .suffix(".plist")
            .tempfile()?;
        file.write_all(&data)?;
        file.flush()?;

        Ok(Self {
            path: file.into_temp_path(),
        })
    }

    /// Filesystem path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// [SigningService] implemented by invoking Apple's `codesign`.
#[derive(Clone, Debug)]
pub struct CodesignTool {
    codesign: PathBuf,
    security: PathBuf,
    verbose: bool,
}

impl Default for CodesignTool {
    fn default() -> Self {
        Self {
            codesign: PathBuf::from("codesign"),
            security: PathBuf::from("security"),
            verbose: false,
        }
    }
}

impl CodesignTool {
    /// Construct an instance that logs invocations at warn level when verbose.
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            ..Default::default()
        }
    }

    /// Use a specific `codesign` executable.
    pub fn with_codesign_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.codesign = program.into();
        self
    }

    /// Use a specific `security` executable.
    pub fn with_security_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.security = program.into();
        self
    }

    fn run(&self, program: &Path, args: &[OsString]) -> Result<Output, ResignError> {
        let level = if self.verbose {
            Level::Warn
        } else {
            Level::Debug
        };
        log!(
            level,
            "+ {} {}",
            program.display(),
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        Command::new(program)
            .args(args)
            .output()
            .map_err(|source| ResignError::ToolLaunch {
                program: program.display().to_string(),
                source,
            })
    }

    /// List the valid code signing identities in the user's keychains.
    pub fn find_identities(&self) -> Result<Vec<CodeSigningIdentity>, ResignError> {
        let args = ["find-identity", "-v", "-p", "codesigning"]
            .iter()
            .map(OsString::from)
            .collect::<Vec<_>>();
        let output = self.run(&self.security, &args)?;

        if !output.status.success() {
            return Err(ResignError::ToolFailed {
                program: self.security.display().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(parse_find_identity_output(&String::from_utf8_lossy(
            &output.stdout,
        )))
    }

    /// Describe the current signature of a path.
    ///
    /// Never fails: an unsigned path, a failing `codesign` or one that can't
    /// be launched all yield an unsigned [SignatureInfo] carrying the reason.
    pub fn signature_info(&self, path: &Path) -> SignatureInfo {
        let output = match self.run(&self.codesign, &display_args(path)) {
            Ok(output) => output,
            Err(e) => {
                debug!("unable to query signature of {}: {}", path.display(), e);
                return SignatureInfo::unsigned(e.to_string());
            }
        };

        // codesign -d writes its report to stderr.
        let mut text = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.stdout.is_empty() {
            text.push('\n');
            text.push_str(&String::from_utf8_lossy(&output.stdout));
        }

        parse_codesign_display(&text, output.status.success())
    }
}

fn remove_signature_args(path: &Path) -> Vec<OsString> {
    vec!["--remove-signature".into(), path.into()]
}

fn sign_args(path: &Path, identity: &str, entitlements: Option<&Path>) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-f".into(), "-s".into(), identity.into()];
    args.push("--timestamp=none".into());

    if let Some(entitlements) = entitlements {
        args.push("--entitlements".into());
        args.push(entitlements.into());
    }

    args.push(path.into());

    args
}

fn verify_args(path: &Path) -> Vec<OsString> {
    vec![
        "--verify".into(),
        "--deep".into(),
        "--strict".into(),
        path.into(),
    ]
}

fn extract_entitlements_args(path: &Path) -> Vec<OsString> {
    ["-d", "--entitlements", ":-"]
        .into_iter()
        .map(OsString::from)
        .chain(std::iter::once(OsStr::new(path).to_os_string()))
        .collect()
}

fn display_args(path: &Path) -> Vec<OsString> {
    vec!["-dvv".into(), path.into()]
}

fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

impl SigningService for CodesignTool {
    fn remove_signature(&self, path: &Path) {
        match self.run(&self.codesign, &remove_signature_args(path)) {
            Ok(output) if !output.status.success() => {
                debug!(
                    "no signature removed from {}: {}",
                    path.display(),
                    stderr_text(&output)
                );
            }
            Ok(_) => {}
            Err(e) => {
                debug!("ignoring signature removal failure: {}", e);
            }
        }
    }

    fn sign(
        &self,
        path: &Path,
        identity: &str,
        entitlements: Option<&Path>,
    ) -> Result<(), ResignError> {
        let output = self.run(&self.codesign, &sign_args(path, identity, entitlements))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ResignError::CodesignFailed {
                path: path.to_path_buf(),
                stderr: stderr_text(&output),
            })
        }
    }

    fn verify_strict(&self, path: &Path) -> Result<(), ResignError> {
        let output = self.run(&self.codesign, &verify_args(path))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ResignError::VerifyFailed {
                path: path.to_path_buf(),
                stderr: stderr_text(&output),
            })
        }
    }

    fn extract_entitlements(&self, path: &Path) -> Option<Dictionary> {
        let output = match self.run(&self.codesign, &extract_entitlements_args(path)) {
            Ok(output) => output,
            Err(e) => {
                debug!("unable to extract entitlements: {}", e);
                return None;
            }
        };

        if !output.status.success() || output.stdout.iter().all(|b| b.is_ascii_whitespace()) {
            return None;
        }

        match Value::from_reader(Cursor::new(&output.stdout)) {
            Ok(Value::Dictionary(d)) => Some(d),
            Ok(_) => None,
            Err(e) => {
                debug!(
                    "unparseable entitlements in signature of {}: {}",
                    path.display(),
                    e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn entitlements_file_lifecycle() -> Result<(), ResignError> {
        let mut ent = Dictionary::new();
        ent.insert("get-task-allow".into(), Value::Boolean(true));

        let file = EntitlementsFile::write(&ent)?;
        let path = file.path().to_path_buf();

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("ents_"));
        assert!(name.ends_with(".plist"));

        let content = std::fs::read_to_string(&path)?;
        assert!(content.starts_with("<?xml"));
        assert_eq!(
            Value::from_file(&path)?.into_dictionary(),
            Some(ent.clone())
        );

        drop(file);
        assert!(!path.exists());

        Ok(())
    }

    #[test]
    fn command_lines() {
        let path = Path::new("/tmp/Main.app");

        assert_eq!(
            sign_args(path, "Apple Distribution: X", Some(Path::new("/tmp/e.plist"))),
            vec![
                "-f",
                "-s",
                "Apple Distribution: X",
                "--timestamp=none",
                "--entitlements",
                "/tmp/e.plist",
                "/tmp/Main.app"
            ]
        );
        assert_eq!(
            sign_args(path, "ABC", None),
            vec!["-f", "-s", "ABC", "--timestamp=none", "/tmp/Main.app"]
        );
        assert_eq!(
            remove_signature_args(path),
            vec!["--remove-signature", "/tmp/Main.app"]
        );
        assert_eq!(
            verify_args(path),
            vec!["--verify", "--deep", "--strict", "/tmp/Main.app"]
        );
        assert_eq!(
            extract_entitlements_args(path),
            vec!["-d", "--entitlements", ":-", "/tmp/Main.app"]
        );
        assert_eq!(display_args(path), vec!["-dvv", "/tmp/Main.app"]);
    }

    #[test]
    fn missing_program() {
        let tool = CodesignTool::new(false)
            .with_codesign_program("/nonexistent/codesign")
            .with_security_program("/nonexistent/security");
        let path = Path::new("/tmp/Main.app");

        // Best-effort operations swallow launch failures.
        tool.remove_signature(path);
        assert_eq!(tool.extract_entitlements(path), None);

        let info = tool.signature_info(path);
        assert!(!info.signed);
        assert!(info
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("/nonexistent/codesign"));

        assert!(matches!(
            tool.sign(path, "ABC", None),
            Err(ResignError::ToolLaunch { .. })
        ));
        assert!(matches!(
            tool.verify_strict(path),
            Err(ResignError::ToolLaunch { .. })
        ));
        assert!(matches!(
            tool.find_identities(),
            Err(ResignError::ToolLaunch { .. })
        ));
    }
}
