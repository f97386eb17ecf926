// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Filtering decorators over disk representations.
//!
//! A [FilterRep] wraps another representation and lets a
//! [ComponentFilter] intercept component queries, forwarding everything
//! else verbatim. The canonical filter is [DetachedRep], which overlays a
//! detached signature onto code that carries none (or whose embedded
//! signature should be ignored).

use {
    crate::{
        disk_rep::{DiskRep, DiskRepWriter, WriterAttributes},
        embedded_signature::{
            create_superblob, CodeSigningMagic, CodeSigningSlot, EmbeddedSignature,
        },
        error::CodeIdentityError,
        macho::{Architecture, MainExecutableImage},
        resources::ResourceBuilder,
    },
    log::debug,
    std::{
        collections::BTreeMap,
        fs::File,
        path::{Path, PathBuf},
        sync::Arc,
    },
};

/// Intercepts component queries on behalf of a [FilterRep].
///
/// Returning `Ok(None)` expresses no opinion: the query is forwarded to
/// the wrapped representation.
pub trait ComponentFilter: Send + Sync {
    fn component(
        &self,
        original: &dyn DiskRep,
        slot: CodeSigningSlot,
    ) -> Result<Option<Vec<u8>>, CodeIdentityError>;
}

/// A representation that defers to another, with component queries
/// filtered.
///
/// This is a read-side decorator: it has no writer of its own.
pub struct FilterRep<F> {
    original: Arc<dyn DiskRep>,
    filter: F,
}

impl<F: ComponentFilter> FilterRep<F> {
    pub fn new(original: Arc<dyn DiskRep>, filter: F) -> Self {
        Self { original, filter }
    }

    /// The wrapped representation.
    pub fn base(&self) -> &Arc<dyn DiskRep> {
        &self.original
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }
}

impl<F: ComponentFilter> DiskRep for FilterRep<F> {
    fn component(&self, slot: CodeSigningSlot) -> Result<Option<Vec<u8>>, CodeIdentityError> {
        match self.filter.component(self.original.as_ref(), slot)? {
            Some(data) => Ok(Some(data)),
            None => self.original.component(slot),
        }
    }

    fn identification(&self) -> Result<Vec<u8>, CodeIdentityError> {
        self.original.identification()
    }

    fn main_executable_path(&self) -> PathBuf {
        self.original.main_executable_path()
    }

    fn canonical_path(&self) -> PathBuf {
        self.original.canonical_path()
    }

    fn recommended_identifier(&self) -> Result<String, CodeIdentityError> {
        self.original.recommended_identifier()
    }

    fn resources_root_path(&self) -> Option<PathBuf> {
        self.original.resources_root_path()
    }

    fn default_resource_rules(&self) -> Option<plist::Value> {
        self.original.default_resource_rules()
    }

    fn adjust_resources(&self, builder: &mut ResourceBuilder) {
        self.original.adjust_resources(builder)
    }

    fn default_requirements(&self, arch: Option<&Architecture>) -> Option<Vec<u8>> {
        self.original.default_requirements(arch)
    }

    fn main_executable_image(&self) -> Result<Option<MainExecutableImage>, CodeIdentityError> {
        self.original.main_executable_image()
    }

    fn page_size(&self) -> usize {
        self.original.page_size()
    }

    fn signing_base(&self) -> u64 {
        self.original.signing_base()
    }

    fn signing_limit(&self) -> Result<u64, CodeIdentityError> {
        self.original.signing_limit()
    }

    fn format(&self) -> String {
        self.original.format()
    }

    fn modified_files(&self) -> Vec<PathBuf> {
        self.original.modified_files()
    }

    fn fd(&self) -> Result<File, CodeIdentityError> {
        self.original.fd()
    }

    fn flush(&self) {
        self.original.flush()
    }
}

/// A detached signature overlaid onto some code.
///
/// Holds the blobs of one embedded-signature superblob, selected from a
/// possibly multi-architecture detached container. Slots whose content
/// lives outside the signature (Info.plist, resource seals) are never
/// claimed; those queries fall through to the real code.
pub struct DetachedRep {
    blobs: BTreeMap<CodeSigningSlot, Vec<u8>>,
}

impl DetachedRep {
    /// Parse detached signature data, selecting a slice by architecture.
    ///
    /// Accepts either a bare embedded-signature superblob or a detached
    /// container keyed by CPU type (raw slot 0 holding the global
    /// signature).
    pub fn from_data(
        data: &[u8],
        arch: Option<&Architecture>,
    ) -> Result<Self, CodeIdentityError> {
        let (magic, _, _) = crate::embedded_signature::read_blob_header(data)?;

        let signature = match CodeSigningMagic::from(magic) {
            CodeSigningMagic::EmbeddedSignature => EmbeddedSignature::from_bytes(data)?,
            CodeSigningMagic::DetachedSignature => {
                let container =
                    EmbeddedSignature::from_bytes_with_magic(data, CodeSigningMagic::DetachedSignature)?;

                let entry = arch
                    .and_then(|arch| {
                        container
                            .blobs
                            .iter()
                            .find(|e| u32::from(e.slot) == arch.cpu_type)
                    })
                    .or_else(|| {
                        container
                            .blobs
                            .iter()
                            .find(|e| u32::from(e.slot) == 0)
                    })
                    .ok_or(CodeIdentityError::DetachedSignatureInvalid(
                        "no signature for the requested architecture",
                    ))?;

                EmbeddedSignature::from_bytes(entry.data)?
            }
            _ => {
                return Err(CodeIdentityError::DetachedSignatureInvalid(
                    "unrecognized detached signature magic",
                ))
            }
        };

        let mut blobs = BTreeMap::new();
        for entry in &signature.blobs {
            blobs.insert(entry.slot, entry.data.to_vec());
        }

        debug!("detached signature provides {} components", blobs.len());

        Ok(Self { blobs })
    }

    pub fn from_path(
        path: &Path,
        arch: Option<&Architecture>,
    ) -> Result<Self, CodeIdentityError> {
        Self::from_data(&std::fs::read(path)?, arch)
    }

    /// Slots this detached signature provides.
    pub fn slots(&self) -> impl Iterator<Item = CodeSigningSlot> + '_ {
        self.blobs.keys().copied()
    }
}

impl ComponentFilter for DetachedRep {
    fn component(
        &self,
        _original: &dyn DiskRep,
        slot: CodeSigningSlot,
    ) -> Result<Option<Vec<u8>>, CodeIdentityError> {
        if slot.has_external_content() {
            return Ok(None);
        }

        Ok(self.blobs.get(&slot).cloned())
    }
}

/// Writes signature components to a standalone detached signature file.
pub struct DetachedWriter {
    path: PathBuf,
    components: Vec<(CodeSigningSlot, Vec<u8>)>,
}

impl DetachedWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            components: Vec::new(),
        }
    }
}

impl DiskRepWriter for DetachedWriter {
    fn component(&mut self, slot: CodeSigningSlot, data: &[u8]) -> Result<(), CodeIdentityError> {
        self.components.retain(|(s, _)| *s != slot);
        self.components.push((slot, data.to_vec()));
        Ok(())
    }

    fn attributes(&self) -> WriterAttributes {
        WriterAttributes::LAST_RESORT | WriterAttributes::NO_GLOBAL
    }

    fn remove(&mut self) -> Result<(), CodeIdentityError> {
        if self.path.is_file() {
            std::fs::remove_file(&self.path)?;
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodeIdentityError> {
        self.components.sort_by_key(|(slot, _)| u32::from(*slot));

        let superblob =
            create_superblob(CodeSigningMagic::EmbeddedSignature, self.components.iter())?;

        std::fs::write(&self.path, superblob)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            disk_rep::best_guess,
            embedded_signature::create_blob,
            macho::fixtures::*,
        },
        goblin::mach::constants::cputype::{CPU_TYPE_ARM64, CPU_TYPE_X86_64},
    };

    fn embedded_signature_with_cd(content: &[u8]) -> Vec<u8> {
        let cd = create_blob(CodeSigningMagic::CodeDirectory, content).unwrap();
        create_superblob(
            CodeSigningMagic::EmbeddedSignature,
            [(CodeSigningSlot::CodeDirectory, cd)].iter(),
        )
        .unwrap()
    }

    #[test]
    fn detached_overlays_unsigned_macho() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        std::fs::write(&path, thin_macho(CPU_TYPE_X86_64)).unwrap();

        let original = best_guess(&path).unwrap();
        assert!(original.component(CodeSigningSlot::CodeDirectory).unwrap().is_none());

        let detached =
            DetachedRep::from_data(&embedded_signature_with_cd(b"detached cd"), None).unwrap();
        let filtered = FilterRep::new(original.clone(), detached);

        let cd = filtered.component(CodeSigningSlot::CodeDirectory).unwrap().unwrap();
        assert_eq!(cd, create_blob(CodeSigningMagic::CodeDirectory, b"detached cd").unwrap());

        // Everything else is forwarded verbatim.
        assert_eq!(
            filtered.main_executable_path(),
            original.main_executable_path()
        );
        assert_eq!(
            filtered.recommended_identifier().unwrap(),
            original.recommended_identifier().unwrap()
        );
        assert_eq!(filtered.modified_files(), original.modified_files());
        assert_eq!(
            filtered.resources_root_path(),
            original.resources_root_path()
        );
        assert_eq!(filtered.format(), original.format());
        assert_eq!(filtered.page_size(), original.page_size());
        assert_eq!(filtered.signing_base(), original.signing_base());
        assert_eq!(
            filtered.signing_limit().unwrap(),
            original.signing_limit().unwrap()
        );
        assert_eq!(
            filtered.identification().unwrap(),
            original.identification().unwrap()
        );
        assert_eq!(filtered.canonical_path(), original.canonical_path());
        assert!(filtered.writer().is_none());
    }

    #[test]
    fn external_content_slots_fall_through() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        std::fs::write(&path, thin_macho(CPU_TYPE_X86_64)).unwrap();
        let original = best_guess(&path).unwrap();

        // A malicious or sloppy detached blob claiming the Info slot must
        // not shadow the real bundle data.
        let info = create_blob(CodeSigningMagic::BlobWrapper, b"bogus info").unwrap();
        let cd = create_blob(CodeSigningMagic::CodeDirectory, b"cd").unwrap();
        let superblob = create_superblob(
            CodeSigningMagic::EmbeddedSignature,
            [
                (CodeSigningSlot::CodeDirectory, cd),
                (CodeSigningSlot::Info, info),
            ]
            .iter(),
        )
        .unwrap();

        let detached = DetachedRep::from_data(&superblob, None).unwrap();
        let filtered = FilterRep::new(original, detached);

        assert!(filtered.component(CodeSigningSlot::Info).unwrap().is_none());
        assert!(filtered.component(CodeSigningSlot::CodeDirectory).unwrap().is_some());
    }

    #[test]
    fn multi_arch_container_selection() {
        let x86 = embedded_signature_with_cd(b"x86 cd");
        let arm = embedded_signature_with_cd(b"arm cd");

        let container = create_superblob(
            CodeSigningMagic::DetachedSignature,
            [
                (CodeSigningSlot::from(CPU_TYPE_X86_64), x86),
                (CodeSigningSlot::from(CPU_TYPE_ARM64), arm),
            ]
            .iter(),
        )
        .unwrap();

        let arch = Architecture::arm64();
        let detached = DetachedRep::from_data(&container, Some(&arch)).unwrap();
        assert_eq!(
            detached.blobs[&CodeSigningSlot::CodeDirectory],
            create_blob(CodeSigningMagic::CodeDirectory, b"arm cd").unwrap()
        );

        // An architecture with no slice and no global fallback is an error.
        let ppc = Architecture::new(18, None);
        let container_without_global = DetachedRep::from_data(&container, Some(&ppc));
        assert!(matches!(
            container_without_global,
            Err(CodeIdentityError::DetachedSignatureInvalid(_))
        ));
    }

    #[test]
    fn multi_arch_container_global_fallback() {
        let global = embedded_signature_with_cd(b"global cd");
        let container = create_superblob(
            CodeSigningMagic::DetachedSignature,
            [(CodeSigningSlot::from(0u32), global)].iter(),
        )
        .unwrap();

        let arch = Architecture::x86_64();
        let detached = DetachedRep::from_data(&container, Some(&arch)).unwrap();
        assert!(detached.blobs.contains_key(&CodeSigningSlot::CodeDirectory));
    }

    #[test]
    fn detached_writer_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let sig_path = dir.path().join("tool.sig");

        let mut writer = DetachedWriter::new(&sig_path);
        assert!(writer.attributes().contains(WriterAttributes::LAST_RESORT));
        assert!(writer.attributes().contains(WriterAttributes::NO_GLOBAL));

        let cd = create_blob(CodeSigningMagic::CodeDirectory, b"written cd").unwrap();
        writer.component(CodeSigningSlot::CodeDirectory, &cd).unwrap();
        writer
            .signature(&create_blob(CodeSigningMagic::BlobWrapper, b"cms").unwrap())
            .unwrap();
        writer.flush().unwrap();

        let detached = DetachedRep::from_path(&sig_path, None).unwrap();
        assert_eq!(detached.blobs[&CodeSigningSlot::CodeDirectory], cd);
        assert!(detached.blobs.contains_key(&CodeSigningSlot::Signature));

        writer.remove().unwrap();
        assert!(!sig_path.exists());
    }
}
