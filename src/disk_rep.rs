// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The disk representation abstraction.
//!
//! A [DiskRep] maps something on disk to the named components of a code
//! signature, hiding how a given format stores them. Thin and universal
//! Mach-O binaries, bundles and plain files all answer the same questions:
//! give me the bytes for a slot, identify yourself, tell me your signable
//! range. Callers obtain a representation through the [best_guess] family
//! of functions and never name a concrete format.

use {
    crate::{
        bundle_rep::BundleRep,
        code_directory::{CodeDirectoryBlob, CodeDirectoryBuilder},
        embedded_signature::CodeSigningSlot,
        error::CodeIdentityError,
        file_rep::FileRep,
        macho::{Architecture, MainExecutableImage},
        macho_rep::MachORep,
        resources::ResourceBuilder,
    },
    bitflags::bitflags,
    goblin::mach::{
        fat::{FAT_CIGAM, FAT_MAGIC},
        header::{MH_CIGAM, MH_CIGAM_64, MH_MAGIC, MH_MAGIC_64},
        peek,
    },
    log::debug,
    std::{
        fs::File,
        io::Read,
        path::{Path, PathBuf},
        sync::Arc,
    },
};

/// Page size for formats digested in fixed-size pages.
pub const SEGMENTED_PAGE_SIZE: usize = 4096;

/// Page size for formats digested as a single run of bytes.
pub const MONOLITHIC_PAGE_SIZE: usize = 0;

/// Caller-provided constraints on how a path is interpreted.
#[derive(Clone, Debug, Default)]
pub struct Context {
    /// Select the slice of a universal binary by architecture.
    pub arch: Option<Architecture>,
    /// Select the slice of a universal binary by exact file offset.
    /// Takes precedence over `arch`. Zero means unset.
    pub offset: u64,
    /// Never interpret the path as a bundle.
    pub file_only: bool,
}

impl Context {
    pub fn with_arch(arch: Architecture) -> Self {
        Self {
            arch: Some(arch),
            ..Default::default()
        }
    }

    pub fn with_offset(offset: u64) -> Self {
        Self {
            offset,
            ..Default::default()
        }
    }
}

/// A disk representation of signable code.
///
/// Implementations are immutable once constructed; interior caches make
/// repeated component queries cheap. All methods are safe to call from
/// multiple threads.
pub trait DiskRep: Send + Sync {
    /// Fetch the bytes of a signing component.
    ///
    /// `Ok(None)` means the component does not exist; errors are reserved
    /// for I/O and parse failures. Repeated calls for the same slot return
    /// the same bytes.
    fn component(&self, slot: CodeSigningSlot) -> Result<Option<Vec<u8>>, CodeIdentityError>;

    /// A stable digest identifying this code, signed or not.
    fn identification(&self) -> Result<Vec<u8>, CodeIdentityError>;

    /// Path to the main executable this representation covers.
    fn main_executable_path(&self) -> PathBuf;

    /// The canonical path naming the whole code object.
    fn canonical_path(&self) -> PathBuf;

    /// A suggested signing identifier derived from the on-disk name.
    fn recommended_identifier(&self) -> Result<String, CodeIdentityError>;

    /// Root directory for sealed resources, if this format has any.
    fn resources_root_path(&self) -> Option<PathBuf> {
        None
    }

    /// Default resource sealing rules as a property list, if applicable.
    fn default_resource_rules(&self) -> Option<plist::Value> {
        None
    }

    /// Adjust a resource rule set under construction, typically to exclude
    /// this representation's own signature artifacts.
    fn adjust_resources(&self, _builder: &mut ResourceBuilder) {}

    /// Default designated requirement bytes for this format, if any.
    fn default_requirements(&self, _arch: Option<&Architecture>) -> Option<Vec<u8>> {
        None
    }

    /// The loaded main executable image, for formats backed by Mach-O.
    fn main_executable_image(&self) -> Result<Option<MainExecutableImage>, CodeIdentityError> {
        Ok(None)
    }

    /// Digest page size in bytes; [MONOLITHIC_PAGE_SIZE] means the whole
    /// signable range is one digest.
    fn page_size(&self) -> usize {
        MONOLITHIC_PAGE_SIZE
    }

    /// File offset where the signable range begins.
    fn signing_base(&self) -> u64 {
        0
    }

    /// Length of the signable range, from [DiskRep::signing_base].
    fn signing_limit(&self) -> Result<u64, CodeIdentityError>;

    /// Human readable description of the format.
    fn format(&self) -> String;

    /// Files a writer for this representation would touch.
    fn modified_files(&self) -> Vec<PathBuf> {
        vec![self.main_executable_path()]
    }

    /// An independent handle to the main executable file.
    fn fd(&self) -> Result<File, CodeIdentityError>;

    /// Drop any interior caches; subsequent queries re-read from disk.
    fn flush(&self) {}

    /// A writer for attaching signature components, if this format
    /// supports writing.
    fn writer(&self) -> Option<Box<dyn DiskRepWriter>> {
        None
    }

    /// The raw code directory blob, if present.
    fn code_directory_data(&self) -> Result<Option<Vec<u8>>, CodeIdentityError> {
        self.component(CodeSigningSlot::CodeDirectory)
    }

    /// The raw CMS signature blob, if present.
    fn signature_data(&self) -> Result<Option<Vec<u8>>, CodeIdentityError> {
        self.component(CodeSigningSlot::Signature)
    }

    /// Whether the main executable is a Mach-O binary.
    fn main_executable_is_macho(&self) -> Result<bool, CodeIdentityError> {
        Ok(self.main_executable_image()?.is_some())
    }
}

bitflags! {
    /// Capabilities and caveats advertised by a [DiskRepWriter].
    pub struct WriterAttributes: u32 {
        /// Use this writer only when no other writer applies.
        const LAST_RESORT = 0x1;
        /// The writer stores data somewhere other than the code itself.
        const NO_GLOBAL = 0x2;
    }
}

/// Destination for signature components being attached to code.
///
/// Components are staged with [DiskRepWriter::component] and committed by
/// [DiskRepWriter::flush]. Nothing is visible to readers until flush.
pub trait DiskRepWriter {
    /// Stage the bytes for a signing component.
    fn component(&mut self, slot: CodeSigningSlot, data: &[u8]) -> Result<(), CodeIdentityError>;

    fn attributes(&self) -> WriterAttributes {
        WriterAttributes::empty()
    }

    /// Contribute format-specific fields to a code directory under
    /// construction.
    fn add_discretionary(&mut self, _builder: &mut CodeDirectoryBuilder) {}

    /// Remove any existing signature from the target.
    fn remove(&mut self) -> Result<(), CodeIdentityError> {
        Ok(())
    }

    /// Commit all staged components.
    fn flush(&mut self) -> Result<(), CodeIdentityError> {
        Ok(())
    }

    /// Stage the CMS signature blob.
    fn signature(&mut self, data: &[u8]) -> Result<(), CodeIdentityError> {
        self.component(CodeSigningSlot::Signature, data)
    }

    /// Serialize and stage a code directory.
    fn code_directory(&mut self, cd: &CodeDirectoryBlob) -> Result<(), CodeIdentityError> {
        self.component(CodeSigningSlot::CodeDirectory, &cd.to_blob_bytes()?)
    }
}

/// Interpret a path as signable code, guessing the format.
///
/// Directories that look like bundles become bundle representations;
/// Mach-O magic yields a Mach-O representation; any other regular file is
/// treated as a generic signable blob. Unrecognized directories are an
/// error, never silently wrapped.
pub fn best_guess(path: &Path) -> Result<Arc<dyn DiskRep>, CodeIdentityError> {
    best_guess_with_context(path, &Context::default())
}

/// Like [best_guess], but refusing bundle interpretation.
pub fn best_file_guess(path: &Path) -> Result<Arc<dyn DiskRep>, CodeIdentityError> {
    best_guess_with_context(
        path,
        &Context {
            file_only: true,
            ..Default::default()
        },
    )
}

/// Interpret the Mach-O slice at an exact offset within a universal file.
pub fn best_guess_at_offset(
    path: &Path,
    offset: u64,
) -> Result<Arc<dyn DiskRep>, CodeIdentityError> {
    best_guess_with_context(path, &Context::with_offset(offset))
}

/// [best_guess] with explicit caller constraints.
///
/// An explicit offset beats an explicit architecture, which beats
/// auto-detection.
pub fn best_guess_with_context(
    path: &Path,
    ctx: &Context,
) -> Result<Arc<dyn DiskRep>, CodeIdentityError> {
    if ctx.offset != 0 {
        debug!("resolving {} at offset {}", path.display(), ctx.offset);
        return Ok(Arc::new(MachORep::from_path_at_offset(path, ctx.offset)?));
    }

    let metadata = std::fs::metadata(path)?;

    if metadata.is_dir() {
        if ctx.file_only {
            return Err(CodeIdentityError::UnrecognizedFormat(path.to_path_buf()));
        }

        if BundleRep::path_is_bundle(path) {
            debug!("resolving {} as a bundle", path.display());
            return Ok(Arc::new(BundleRep::from_path(path)?));
        }

        return Err(CodeIdentityError::UnrecognizedFormat(path.to_path_buf()));
    }

    let mut header = [0u8; 8];
    let read = File::open(path)?.read(&mut header)?;

    if read >= 8 {
        // peek() reads little-endian, so big-endian files on disk surface
        // as the byte-swapped CIGAM forms.
        let is_macho = matches!(
            peek(&header, 0)?,
            FAT_MAGIC | FAT_CIGAM | MH_MAGIC | MH_CIGAM | MH_MAGIC_64 | MH_CIGAM_64
        );

        if is_macho {
            debug!("resolving {} as Mach-O", path.display());
            return Ok(Arc::new(MachORep::from_path_with_context(path, ctx)?));
        }
    }

    debug!("resolving {} as a generic blob", path.display());
    Ok(Arc::new(FileRep::from_path(path)?))
}

#[cfg(test)]
mod tests {
    use {super::*, crate::macho::fixtures::*, std::io::Write};

    #[test]
    fn guesses_generic_blob() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"plain old data").unwrap();

        let rep = best_guess(&path).unwrap();
        assert_eq!(rep.format(), "generic blob");
        assert_eq!(rep.page_size(), MONOLITHIC_PAGE_SIZE);
    }

    #[test]
    fn guesses_macho() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        let mut fh = std::fs::File::create(&path).unwrap();
        fh.write_all(&thin_macho(goblin::mach::constants::cputype::CPU_TYPE_ARM64))
            .unwrap();
        drop(fh);

        let rep = best_guess(&path).unwrap();
        assert!(rep.format().starts_with("Mach-O"));
        assert_eq!(rep.page_size(), SEGMENTED_PAGE_SIZE);
        assert_eq!(rep.signing_base(), 0);
        assert_eq!(rep.signing_limit().unwrap(), 1024);
        assert!(rep.main_executable_image().unwrap().is_some());
        assert_eq!(rep.main_executable_path(), path);
    }

    #[test]
    fn guesses_universal_macho() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fat_tool");
        std::fs::write(
            &path,
            fat_macho(&[(
                goblin::mach::constants::cputype::CPU_TYPE_X86_64,
                thin_macho(goblin::mach::constants::cputype::CPU_TYPE_X86_64),
            )]),
        )
        .unwrap();

        let rep = best_guess(&path).unwrap();
        assert!(rep.format().starts_with("Mach-O universal"));
        assert_eq!(rep.signing_base(), 4096);
    }

    #[test]
    fn unrecognized_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("stuff");
        std::fs::create_dir(&plain).unwrap();

        assert!(matches!(
            best_guess(&plain),
            Err(CodeIdentityError::UnrecognizedFormat(_))
        ));
    }

    #[test]
    fn file_only_refuses_bundles() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("Widget.app");
        std::fs::create_dir_all(bundle.join("Contents/MacOS")).unwrap();

        let mut info = plist::Dictionary::new();
        info.insert(
            "CFBundleExecutable".to_string(),
            plist::Value::String("widget".to_string()),
        );
        plist::Value::Dictionary(info)
            .to_file_xml(bundle.join("Contents/Info.plist"))
            .unwrap();
        std::fs::write(
            bundle.join("Contents/MacOS/widget"),
            thin_macho(goblin::mach::constants::cputype::CPU_TYPE_X86_64),
        )
        .unwrap();

        assert!(best_guess(&bundle).is_ok());
        assert!(matches!(
            best_file_guess(&bundle),
            Err(CodeIdentityError::UnrecognizedFormat(_))
        ));
    }
}
