// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identity edits to bundle `Info.plist` files.

use {
    crate::identifier::{map_identifier, IdentifierMapping},
    plist::{Dictionary, Value},
};

const URL_TYPES_KEY: &str = "CFBundleURLTypes";
const URL_NAME_KEY: &str = "CFBundleURLName";
const URL_SCHEMES_KEY: &str = "CFBundleURLSchemes";

/// Metadata edits applied to every bundle of a run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InfoPlistEdits {
    /// New `CFBundleShortVersionString`.
    pub short_version: Option<String>,
    /// New `CFBundleVersion`.
    pub build: Option<String>,
    /// New `CFBundleDisplayName`, also used for `CFBundleName`.
    pub display_name: Option<String>,
    /// Rewrite every string value carrying the old identifier.
    pub rewrite_bundle_id_values: bool,
}

/// What [apply_identity_edits()] changed in a single `Info.plist`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct InfoPlistChanges {
    /// `CFBundleIdentifier` was changed.
    pub identifier_changed: bool,
    /// Number of URL type names and schemes rewritten.
    pub url_type_values: usize,
    /// Number of other string values rewritten.
    pub string_values: usize,
}

impl InfoPlistChanges {
    /// Whether anything changed.
    pub fn is_empty(&self) -> bool {
        !self.identifier_changed && self.url_type_values == 0 && self.string_values == 0
    }
}

/// Map a single string value, returning the new value if it changes.
///
/// When the new identifier extends the old one, values already carrying the
/// new identifier are left alone so they aren't extended twice.
fn rewrite_value(value: &str, old_id: &str, new_id: &str) -> Option<String> {
    let extended = new_id
        .strip_prefix(old_id)
        .map(|rest| rest.starts_with('.'))
        .unwrap_or(false);

    if extended
        && (value == new_id
            || value
                .strip_prefix(new_id)
                .map(|rest| rest.starts_with('.'))
                .unwrap_or(false))
    {
        return None;
    }

    let mapped = map_identifier(value, old_id, new_id);

    if mapped == value {
        None
    } else {
        Some(mapped)
    }
}

fn rewrite_string_in_place(value: &mut Value, old_id: &str, new_id: &str) -> usize {
    if let Value::String(s) = value {
        if let Some(new) = rewrite_value(s, old_id, new_id) {
            *s = new;
            return 1;
        }
    }

    0
}

/// Rewrite identifier-derived URL type names and schemes.
///
/// Returns the number of rewritten values.
pub fn rewrite_url_types(plist: &mut Dictionary, old_id: &str, new_id: &str) -> usize {
    let mut count = 0;

    let Some(Value::Array(url_types)) = plist.get_mut(URL_TYPES_KEY) else {
        return 0;
    };

    for url_type in url_types.iter_mut() {
        let Value::Dictionary(url_type) = url_type else {
            continue;
        };

        if let Some(name) = url_type.get_mut(URL_NAME_KEY) {
            count += rewrite_string_in_place(name, old_id, new_id);
        }

        if let Some(Value::Array(schemes)) = url_type.get_mut(URL_SCHEMES_KEY) {
            for scheme in schemes.iter_mut() {
                count += rewrite_string_in_place(scheme, old_id, new_id);
            }
        }
    }

    count
}

/// Collect the URL schemes an `Info.plist` declares.
///
/// Schemes are returned in declaration order without duplicates. Malformed
/// entries and empty schemes are skipped.
pub fn url_schemes(plist: &Dictionary) -> Vec<String> {
    let mut schemes = vec![];

    let Some(Value::Array(url_types)) = plist.get(URL_TYPES_KEY) else {
        return schemes;
    };

    for url_type in url_types {
        let Some(Value::Array(values)) = url_type
            .as_dictionary()
            .and_then(|d| d.get(URL_SCHEMES_KEY))
        else {
            continue;
        };

        for scheme in values.iter().filter_map(|v| v.as_string()) {
            if !scheme.is_empty() && !schemes.iter().any(|s| s == scheme) {
                schemes.push(scheme.to_string());
            }
        }
    }

    schemes
}

/// Rewrite every identifier-derived string value in a dictionary.
///
/// Nested dictionaries and arrays are descended into. Keys are never
/// changed. Returns the number of rewritten values.
pub fn rewrite_bundle_id_strings(plist: &mut Dictionary, old_id: &str, new_id: &str) -> usize {
    let mut count = 0;
    let mut stack = plist.iter_mut().map(|(_, v)| v).collect::<Vec<_>>();

    while let Some(value) = stack.pop() {
        match value {
            Value::Dictionary(d) => stack.extend(d.iter_mut().map(|(_, v)| v)),
            Value::Array(a) => stack.extend(a.iter_mut()),
            v => count += rewrite_string_in_place(v, old_id, new_id),
        }
    }

    count
}

/// Apply identity edits to a bundle's `Info.plist` content.
///
/// Identifier rewriting only happens when `mapping` changes the identifier.
/// Version and name edits always apply.
pub fn apply_identity_edits(
    plist: &mut Dictionary,
    mapping: &IdentifierMapping,
    edits: &InfoPlistEdits,
) -> InfoPlistChanges {
    let mut changes = InfoPlistChanges::default();

    if mapping.changed() {
        changes.url_type_values = rewrite_url_types(plist, &mapping.old, &mapping.new);

        if edits.rewrite_bundle_id_values {
            changes.string_values = rewrite_bundle_id_strings(plist, &mapping.old, &mapping.new);
        }

        plist.insert(
            "CFBundleIdentifier".into(),
            Value::String(mapping.new.clone()),
        );
        changes.identifier_changed = true;
    }

    if let Some(version) = &edits.short_version {
        plist.insert(
            "CFBundleShortVersionString".into(),
            Value::String(version.clone()),
        );
    }

    if let Some(build) = &edits.build {
        plist.insert("CFBundleVersion".into(), Value::String(build.clone()));
    }

    if let Some(name) = &edits.display_name {
        plist.insert("CFBundleDisplayName".into(), Value::String(name.clone()));
        plist.insert("CFBundleName".into(), Value::String(name.clone()));
    }

    changes
}
