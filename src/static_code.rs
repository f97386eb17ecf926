// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Static code: code at rest on disk.
//!
//! A [StaticCode] gives signature-level meaning to a disk representation:
//! it parses the code directory, exposes the signing identifier and cdhash,
//! and validates the sealed identity against what is actually on disk.

use {
    crate::{
        code_directory::CodeDirectoryBlob,
        disk_rep::{best_guess, best_guess_with_context, Context, DiskRep},
        embedded_signature::CodeSigningSlot,
        error::CodeIdentityError,
    },
    bitflags::bitflags,
    log::debug,
    std::{path::Path, sync::Arc},
};

bitflags! {
    /// Options controlling [StaticCode::validate].
    pub struct ValidationFlags: u32 {
        /// Require a CMS signature component, rejecting ad-hoc signatures.
        const REQUIRE_CMS_SIGNATURE = 0x1;
    }
}

impl Default for ValidationFlags {
    fn default() -> Self {
        ValidationFlags::empty()
    }
}

/// Code at rest, addressed through a disk representation.
#[derive(Clone)]
pub struct StaticCode {
    rep: Arc<dyn DiskRep>,
}

impl StaticCode {
    pub fn new(rep: Arc<dyn DiskRep>) -> Self {
        Self { rep }
    }

    pub fn from_path(path: &Path) -> Result<Self, CodeIdentityError> {
        Ok(Self::new(best_guess(path)?))
    }

    pub fn from_path_with_context(path: &Path, ctx: &Context) -> Result<Self, CodeIdentityError> {
        Ok(Self::new(best_guess_with_context(path, ctx)?))
    }

    /// The underlying disk representation.
    pub fn disk_rep(&self) -> &Arc<dyn DiskRep> {
        &self.rep
    }

    /// Fetch a signing component from the representation.
    pub fn component(
        &self,
        slot: CodeSigningSlot,
    ) -> Result<Option<Vec<u8>>, CodeIdentityError> {
        self.rep.component(slot)
    }

    /// Raw code directory blob bytes, if this code is signed.
    pub fn code_directory_data(&self) -> Result<Option<Vec<u8>>, CodeIdentityError> {
        self.rep.code_directory_data()
    }

    /// Raw CMS signature bytes, if present.
    pub fn signature_data(&self) -> Result<Option<Vec<u8>>, CodeIdentityError> {
        self.rep.signature_data()
    }

    /// The parsed code directory, if this code is signed.
    pub fn code_directory(&self) -> Result<Option<CodeDirectoryBlob>, CodeIdentityError> {
        match self.code_directory_data()? {
            Some(data) => Ok(Some(CodeDirectoryBlob::from_blob_bytes(&data)?)),
            None => Ok(None),
        }
    }

    /// The signing identifier sealed into the code directory.
    pub fn identifier(&self) -> Result<String, CodeIdentityError> {
        let cd = self.code_directory()?.ok_or(CodeIdentityError::Unsigned)?;
        Ok(cd.ident)
    }

    /// The digest of the code directory, which names this signature.
    pub fn cd_hash(&self) -> Result<Vec<u8>, CodeIdentityError> {
        let data = self
            .code_directory_data()?
            .ok_or(CodeIdentityError::Unsigned)?;
        let cd = CodeDirectoryBlob::from_blob_bytes(&data)?;

        cd.digest_type.digest_data(&data)
    }

    /// A stable identity for this code, signed or not.
    pub fn identification(&self) -> Result<Vec<u8>, CodeIdentityError> {
        self.rep.identification()
    }

    /// Validate the sealed identity against the code on disk.
    ///
    /// Checks that a well-formed code directory exists, that its sealed
    /// code limit matches the representation's signable range, and
    /// (optionally) that a CMS signature is present.
    pub fn validate(&self, flags: ValidationFlags) -> Result<(), CodeIdentityError> {
        let data = self
            .code_directory_data()?
            .ok_or(CodeIdentityError::Unsigned)?;
        let cd = CodeDirectoryBlob::from_blob_bytes(&data)?;

        if cd.ident.is_empty() {
            return Err(CodeIdentityError::CodeDirectoryMalformedIdentifier);
        }

        let sealed_limit = cd.effective_code_limit();
        let actual_limit = self.rep.signing_limit()?;

        if sealed_limit != actual_limit {
            debug!(
                "sealed code limit {} does not match on-disk limit {}",
                sealed_limit, actual_limit
            );
            return Err(CodeIdentityError::StaticCodeChanged);
        }

        if flags.contains(ValidationFlags::REQUIRE_CMS_SIGNATURE) {
            match self.signature_data()? {
                // An empty blob wrapper is just a header.
                Some(data) if data.len() > 8 => {}
                _ => return Err(CodeIdentityError::SignatureMissing),
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for StaticCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCode")
            .field("path", &self.rep.canonical_path())
            .field("format", &self.rep.format())
            .finish()
    }
}
