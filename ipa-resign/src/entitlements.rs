// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Code entitlements handling.

Every bundle is signed with its own entitlements document. This module
decides which document each bundle receives, rewrites the identity-bearing
fields in it to follow a bundle identifier change, and validates the result.

Validation runs for all bundles before anything is signed. Problems are
reported together so an operator sees everything that needs fixing at once.
*/

use {
    crate::{error::ResignError, identifier::IdentifierMapping, profile::Profile},
    log::{debug, info},
    plist::{Dictionary, Value},
    std::{
        collections::BTreeMap,
        fmt::Formatter,
        path::{Path, PathBuf},
    },
};

/// Entitlement keys holding the `<team>.<bundle id>` application identifier.
///
/// When both are present they must hold the same value.
pub const APPLICATION_IDENTIFIER_KEYS: [&str; 2] =
    ["application-identifier", "com.apple.application-identifier"];

/// Entitlement key holding the ordered list of keychain access groups.
pub const KEYCHAIN_ACCESS_GROUPS_KEY: &str = "keychain-access-groups";

/// Final entitlements of each bundle, keyed by bundle path.
///
/// `None` means the bundle is signed without entitlements.
pub type EntitlementsMap = BTreeMap<PathBuf, Option<Dictionary>>;

/// Rewrite identity-bearing entitlements for a bundle identifier change.
///
/// Application identifier keys that are present are set to
/// `<team_id>.<new_id>`. Keychain access groups beginning with
/// `<team_id>.<old_id>` have that prefix replaced by `<team_id>.<new_id>`.
/// Groups already carrying the new prefix and all other values are left
/// untouched, in their original order.
///
/// This is a no-op if `team_id` is empty or the identifier doesn't change,
/// and applying it twice yields the same document as applying it once.
pub fn rewrite_entitlements(
    entitlements: &Dictionary,
    team_id: &str,
    old_id: &str,
    new_id: &str,
) -> Dictionary {
    let mut res = entitlements.clone();

    if team_id.is_empty() || old_id == new_id {
        return res;
    }

    let new_prefix = format!("{}.{}", team_id, new_id);
    let old_prefix = format!("{}.{}", team_id, old_id);

    for key in APPLICATION_IDENTIFIER_KEYS {
        if let Some(value) = res.get_mut(key) {
            *value = Value::String(new_prefix.clone());
        }
    }

    let extended = extends_prefix(&new_prefix, &old_prefix);

    if let Some(Value::Array(groups)) = res.get_mut(KEYCHAIN_ACCESS_GROUPS_KEY) {
        for group in groups.iter_mut() {
            if let Value::String(s) = group {
                if extended && s.starts_with(&new_prefix) {
                    continue;
                }

                if let Some(suffix) = s.strip_prefix(&old_prefix) {
                    *s = format!("{}{}", new_prefix, suffix);
                }
            }
        }
    }

    res
}

/// Whether `new_prefix` strictly extends `old_prefix`.
///
/// Only then can a value carrying `new_prefix` be the result of an earlier
/// rewrite. A shortened or merely overlapping new identifier doesn't qualify.
fn extends_prefix(new_prefix: &str, old_prefix: &str) -> bool {
    new_prefix.len() > old_prefix.len() && new_prefix.starts_with(old_prefix)
}

/// Obtain the team identifier from a `TEAMID.bundle.id` value.
pub fn team_id_from_application_identifier(value: &str) -> Option<&str> {
    let (team, _) = value.split_once('.')?;
    let team = team.trim();

    if team.is_empty() {
        None
    } else {
        Some(team)
    }
}

/// Validate the identity-bearing fields of a bundle's entitlements.
///
/// Returns every problem found. An empty result means the entitlements are
/// consistent.
///
/// `profile_team_id` takes precedence over a team identifier inferred from an
/// existing application identifier. Without either, identifier expectations
/// and stale keychain prefixes can't be checked and are skipped.
///
/// `require_app_identifier` turns a missing application identifier into an
/// error.
pub fn validate_entitlements(
    entitlements: &Dictionary,
    mapping: &IdentifierMapping,
    profile_team_id: Option<&str>,
    require_app_identifier: bool,
) -> Vec<String> {
    let mut errors = vec![];
    let mut app_ids: Vec<(&str, &str)> = vec![];

    for key in APPLICATION_IDENTIFIER_KEYS {
        match entitlements.get(key) {
            None => {}
            Some(Value::String(s)) if !s.trim().is_empty() => {
                app_ids.push((key, s.trim()));
            }
            Some(_) => {
                errors.push(format!("{} must be a non-empty string", key));
            }
        }
    }

    if require_app_identifier && app_ids.is_empty() {
        errors.push(format!("missing {}", APPLICATION_IDENTIFIER_KEYS.join("/")));
    }

    if app_ids.windows(2).any(|w| w[0].1 != w[1].1) {
        errors.push(format!(
            "{} and {} must match",
            APPLICATION_IDENTIFIER_KEYS[0], APPLICATION_IDENTIFIER_KEYS[1]
        ));
    }

    let team_id = profile_team_id
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .or_else(|| {
            app_ids
                .iter()
                .find_map(|(_, value)| team_id_from_application_identifier(value))
        });

    if let Some(team_id) = team_id {
        if !mapping.new.is_empty() {
            let expected = format!("{}.{}", team_id, mapping.new);

            for (key, value) in &app_ids {
                if *value != expected {
                    errors.push(format!(
                        "{} mismatch: expected {}, got {}",
                        key, expected, value
                    ));
                }
            }
        }
    }

    match entitlements.get(KEYCHAIN_ACCESS_GROUPS_KEY) {
        None => {}
        Some(Value::Array(groups)) => {
            for (i, group) in groups.iter().enumerate() {
                if group.as_string().is_none() {
                    errors.push(format!("{}[{}] must be a string", KEYCHAIN_ACCESS_GROUPS_KEY, i));
                }
            }

            if let Some(team_id) = team_id {
                if !mapping.old.is_empty() && !mapping.new.is_empty() && mapping.changed() {
                    let old_prefix = format!("{}.{}", team_id, mapping.old);
                    let new_prefix = format!("{}.{}", team_id, mapping.new);

                    let extended = extends_prefix(&new_prefix, &old_prefix);

                    let stale = groups.iter().filter_map(|g| g.as_string()).any(|g| {
                        g.starts_with(&old_prefix) && !(extended && g.starts_with(&new_prefix))
                    });

                    if stale {
                        errors.push(format!(
                            "{} contains old bundle prefix {}",
                            KEYCHAIN_ACCESS_GROUPS_KEY, old_prefix
                        ));
                    }
                }
            }
        }
        Some(_) => {
            errors.push(format!("{} must be an array", KEYCHAIN_ACCESS_GROUPS_KEY));
        }
    }

    errors
}

/// Validation problems of a single bundle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BundleViolations {
    pub bundle: PathBuf,
    pub violations: Vec<String>,
}

impl std::fmt::Display for BundleViolations {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid entitlements for bundle {}:\n  - {}",
            self.bundle.display(),
            self.violations.join("\n  - ")
        )
    }
}

/// Validation problems across all bundles of a run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EntitlementsViolations(pub Vec<BundleViolations>);

impl EntitlementsViolations {
    /// Whether no problems were recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Problems recorded for a bundle, if any.
    pub fn for_bundle(&self, bundle: &Path) -> Option<&[String]> {
        self.0
            .iter()
            .find(|v| v.bundle == bundle)
            .map(|v| v.violations.as_slice())
    }
}

impl std::fmt::Display for EntitlementsViolations {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, bundle) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{}", bundle)?;
        }

        Ok(())
    }
}

/// Where a bundle's entitlements came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum EntitlementsSource {
    Explicit,
    ExistingSignature,
    Profile,
}

impl std::fmt::Display for EntitlementsSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Explicit => "explicit entitlements",
            Self::ExistingSignature => "existing signature",
            Self::Profile => "provisioning profile",
        })
    }
}

/// Resolve the entitlements each bundle will be signed with.
///
/// Per bundle, the first available source wins:
///
/// 1. `explicit`, used verbatim for every bundle.
/// 2. Entitlements in the bundle's current signature, via `extract`.
/// 3. The entitlements declared by `profile`.
///
/// If none apply, the bundle maps to `None` and is signed without entitlements.
///
/// For bundles with an identifier mapping, entitlements are rewritten with the
/// profile's team identifier (when a profile is given) and then validated.
/// Violations of all bundles are collected and returned together as
/// [ResignError::InvalidEntitlements].
pub fn resolve_entitlements(
    bundles: &[PathBuf],
    mappings: &BTreeMap<PathBuf, IdentifierMapping>,
    explicit: Option<&Dictionary>,
    profile: Option<&Profile>,
    mut extract: impl FnMut(&Path) -> Option<Dictionary>,
    require_app_identifier: bool,
) -> Result<EntitlementsMap, ResignError> {
    let mut res = EntitlementsMap::new();
    let mut violations = EntitlementsViolations::default();

    for bundle in bundles {
        let resolved = if let Some(explicit) = explicit {
            Some((explicit.clone(), EntitlementsSource::Explicit))
        } else if let Some(existing) = extract(bundle) {
            Some((existing, EntitlementsSource::ExistingSignature))
        } else {
            profile.map(|p| (p.entitlements.clone(), EntitlementsSource::Profile))
        };

        let Some((mut entitlements, source)) = resolved else {
            info!("{}: no entitlements", bundle.display());
            res.insert(bundle.clone(), None);
            continue;
        };

        info!("{}: using entitlements from {}", bundle.display(), source);

        if let Some(mapping) = mappings.get(bundle) {
            if let Some(profile) = profile {
                entitlements =
                    rewrite_entitlements(&entitlements, &profile.team_id, &mapping.old, &mapping.new);
            }

            let errors = validate_entitlements(
                &entitlements,
                mapping,
                profile.map(|p| p.team_id.as_str()),
                require_app_identifier,
            );

            if !errors.is_empty() {
                debug!(
                    "{}: {} entitlements violation(s)",
                    bundle.display(),
                    errors.len()
                );
                violations.0.push(BundleViolations {
                    bundle: bundle.clone(),
                    violations: errors,
                });
            }
        }

        res.insert(bundle.clone(), Some(entitlements));
    }

    if violations.is_empty() {
        Ok(res)
    } else {
        Err(ResignError::InvalidEntitlements(violations))
    }
}

/// Load an entitlements plist file.
///
/// The root element must be a dictionary.
pub fn load_entitlements_file(path: &Path) -> Result<Dictionary, ResignError> {
    if !path.is_file() {
        return Err(ResignError::EntitlementsNotFound(path.to_path_buf()));
    }

    Value::from_file(path)?
        .into_dictionary()
        .ok_or_else(|| ResignError::EntitlementsNotDictionary(path.to_path_buf()))
}
