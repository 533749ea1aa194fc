// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Re-signing of iOS applications with a new identity.
//!
//! This crate takes an extracted iOS application (a `Payload/*.app` tree),
//! optionally changes its bundle identifier, and signs every nested component
//! again with Apple's `codesign`. The interesting part is keeping everything
//! consistent:
//!
//! * A new main application identifier propagates to all nested bundles whose
//!   identifiers derive from it. (See [map_identifier()].)
//! * Each bundle gets an entitlements document from an explicit file, its
//!   current signature, or a provisioning profile. Identity bearing
//!   entitlements are rewritten for the new identifier and validated before
//!   anything is signed. (See [entitlements].)
//! * Nested content is signed before the bundle containing it and the result
//!   is verified. (See [BundleSigner].)
//!
//! [Resigner] runs all of this end to end. Signing itself goes through the
//! [SigningService] trait, implemented for `codesign` by [CodesignTool].
//!
//! Packaging (zipping the result back into an `.ipa`) is not handled here.

mod bundle_signing;
pub use bundle_signing::*;
pub mod cli;
pub mod entitlements;
mod error;
pub use error::*;
mod identifier;
pub use identifier::*;
pub mod info_plist;
mod inspect;
pub use inspect::*;
mod pipeline;
pub use pipeline::*;
mod profile;
pub use profile::*;
mod settings;
pub use settings::*;
mod signing_service;
pub use signing_service::*;
