// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disk representation for Mach-O binaries.
//!
//! A [MachORep] always denotes a single architecture slice. For thin
//! binaries that slice is the whole file; for universal binaries the slice
//! is selected at construction time by offset, by architecture, or by
//! defaulting to the first slice listed in the fat header.

use {
    crate::{
        disk_rep::{Context, DiskRep, SEGMENTED_PAGE_SIZE},
        embedded_signature::{CodeSigningSlot, DigestType, EmbeddedSignature},
        error::CodeIdentityError,
        macho::{Architecture, MachOSignature, MainExecutableImage},
    },
    goblin::mach::{Mach, MachO},
    log::debug,
    std::{
        fs::File,
        path::{Path, PathBuf},
        sync::{Arc, Mutex},
    },
};

#[derive(Default)]
struct RepState {
    file: Option<File>,
    slice_data: Option<Arc<Vec<u8>>>,
}

/// A Mach-O binary (or one slice of a universal binary) on disk.
pub struct MachORep {
    path: PathBuf,
    slice_offset: u64,
    slice_len: u64,
    arch: Architecture,
    universal: bool,
    state: Mutex<RepState>,
}

impl MachORep {
    /// Interpret a Mach-O file, auto-selecting the slice.
    pub fn from_path(path: &Path) -> Result<Self, CodeIdentityError> {
        Self::from_path_with_context(path, &Context::default())
    }

    /// Interpret a Mach-O file under caller constraints.
    pub fn from_path_with_context(path: &Path, ctx: &Context) -> Result<Self, CodeIdentityError> {
        if ctx.offset != 0 {
            return Self::from_path_at_offset(path, ctx.offset);
        }

        let image = MainExecutableImage::from_path(path)?;

        match image.parse()? {
            Mach::Binary(macho) => {
                if let Some(wanted) = &ctx.arch {
                    if !wanted.matches_macho(&macho) {
                        return Err(CodeIdentityError::ArchitectureNotFound(wanted.to_string()));
                    }
                }

                Ok(Self {
                    path: path.to_path_buf(),
                    slice_offset: 0,
                    slice_len: image.data().len() as u64,
                    arch: Architecture::new(macho.header.cputype, Some(macho.header.cpusubtype)),
                    universal: false,
                    state: Mutex::new(RepState::default()),
                })
            }
            Mach::Fat(_) => {
                let slice = match &ctx.arch {
                    Some(wanted) => image.find_slice(wanted)?.ok_or_else(|| {
                        CodeIdentityError::ArchitectureNotFound(wanted.to_string())
                    })?,
                    None => {
                        // No constraint given. The first slice in the fat
                        // header is the canonical default.
                        *image.slices()?.first().ok_or_else(|| {
                            CodeIdentityError::InvalidBinary(
                                "universal binary contains no slices".into(),
                            )
                        })?
                    }
                };

                debug!(
                    "selected {} slice at offset {} in {}",
                    slice.arch,
                    slice.offset,
                    path.display()
                );

                Self::for_slice(path, &image, slice.offset, slice.size)
            }
        }
    }

    /// Interpret the slice at an exact file offset.
    pub fn from_path_at_offset(path: &Path, offset: u64) -> Result<Self, CodeIdentityError> {
        let image = MainExecutableImage::from_path(path)?;

        let slice = image
            .slice_at_offset(offset)?
            .ok_or(CodeIdentityError::SliceNotFound(offset))?;

        Self::for_slice(path, &image, slice.offset, slice.size)
    }

    fn for_slice(
        path: &Path,
        image: &MainExecutableImage,
        offset: u64,
        size: u64,
    ) -> Result<Self, CodeIdentityError> {
        let end = (offset + size) as usize;
        if end > image.data().len() {
            return Err(CodeIdentityError::InvalidBinary(format!(
                "slice {}..{} exceeds file size {}",
                offset,
                end,
                image.data().len()
            )));
        }

        // Validate the slice parses before committing to it.
        let data = &image.data()[offset as usize..end];
        let macho = MachO::parse(data, 0)?;
        let arch = Architecture::new(macho.header.cputype, Some(macho.header.cpusubtype));

        Ok(Self {
            path: path.to_path_buf(),
            slice_offset: offset,
            slice_len: size,
            arch,
            universal: offset != 0 || matches!(image.parse()?, Mach::Fat(_)),
            state: Mutex::new(RepState {
                file: None,
                slice_data: Some(Arc::new(data.to_vec())),
            }),
        })
    }

    /// The architecture of the represented slice.
    pub fn arch(&self) -> Architecture {
        self.arch
    }

    fn slice_data(&self) -> Result<Arc<Vec<u8>>, CodeIdentityError> {
        let mut state = self.state.lock().unwrap();

        if let Some(data) = &state.slice_data {
            return Ok(data.clone());
        }

        let whole = std::fs::read(&self.path)?;
        let end = (self.slice_offset + self.slice_len) as usize;
        if end > whole.len() {
            return Err(CodeIdentityError::SliceNotFound(self.slice_offset));
        }

        let data = Arc::new(whole[self.slice_offset as usize..end].to_vec());
        state.slice_data = Some(data.clone());

        Ok(data)
    }

    fn with_signature<T>(
        &self,
        f: impl FnOnce(Option<&EmbeddedSignature>) -> Result<T, CodeIdentityError>,
    ) -> Result<T, CodeIdentityError> {
        let data = self.slice_data()?;
        let macho = MachO::parse(&data, 0)?;

        match macho.code_signature()? {
            Some(signature) => f(Some(&signature)),
            None => f(None),
        }
    }
}

impl DiskRep for MachORep {
    fn component(&self, slot: CodeSigningSlot) -> Result<Option<Vec<u8>>, CodeIdentityError> {
        self.with_signature(|signature| {
            Ok(signature.and_then(|sig| sig.slot_data(slot)))
        })
    }

    fn identification(&self) -> Result<Vec<u8>, CodeIdentityError> {
        // Signed code is identified by its code directory; unsigned code
        // by a digest of its leading bytes, so identity is stable either
        // way.
        if let Some(cd) = self.code_directory_data()? {
            return DigestType::Sha256.digest_data(&cd);
        }

        let data = self.slice_data()?;
        let head = &data[..data.len().min(SEGMENTED_PAGE_SIZE)];

        DigestType::Sha256.digest_data(head)
    }

    fn main_executable_path(&self) -> PathBuf {
        self.path.clone()
    }

    fn canonical_path(&self) -> PathBuf {
        self.path.clone()
    }

    fn recommended_identifier(&self) -> Result<String, CodeIdentityError> {
        Ok(self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string()))
    }

    fn main_executable_image(&self) -> Result<Option<MainExecutableImage>, CodeIdentityError> {
        Ok(Some(MainExecutableImage::from_path(&self.path)?))
    }

    fn page_size(&self) -> usize {
        SEGMENTED_PAGE_SIZE
    }

    fn signing_base(&self) -> u64 {
        self.slice_offset
    }

    fn signing_limit(&self) -> Result<u64, CodeIdentityError> {
        let data = self.slice_data()?;
        let macho = MachO::parse(&data, 0)?;

        Ok(macho.code_limit_offset().unwrap_or(self.slice_len))
    }

    fn format(&self) -> String {
        if self.universal {
            format!("Mach-O universal ({})", self.arch)
        } else {
            format!("Mach-O thin ({})", self.arch)
        }
    }

    fn fd(&self) -> Result<File, CodeIdentityError> {
        let mut state = self.state.lock().unwrap();

        // Hand out independent handles over one cached descriptor.
        if let Some(file) = &state.file {
            return Ok(file.try_clone()?);
        }

        let file = File::open(&self.path)?;
        let handle = file.try_clone()?;
        state.file = Some(file);

        Ok(handle)
    }

    fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        state.file = None;
        state.slice_data = None;
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            embedded_signature::{create_blob, create_superblob, CodeSigningMagic},
            macho::fixtures::*,
        },
        goblin::mach::constants::cputype::{CPU_TYPE_ARM64, CPU_TYPE_X86_64},
    };

    fn write_temp(data: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binary");
        std::fs::write(&path, data).unwrap();
        (dir, path)
    }

    fn test_signature() -> Vec<u8> {
        let cd = create_blob(CodeSigningMagic::CodeDirectory, b"directory bytes").unwrap();
        create_superblob(
            CodeSigningMagic::EmbeddedSignature,
            [(CodeSigningSlot::CodeDirectory, cd)].iter(),
        )
        .unwrap()
    }

    #[test]
    fn thin_unsigned() {
        let (_dir, path) = write_temp(&thin_macho(CPU_TYPE_X86_64));
        let rep = MachORep::from_path(&path).unwrap();

        assert_eq!(rep.signing_base(), 0);
        assert_eq!(rep.signing_limit().unwrap(), 1024);
        assert_eq!(rep.page_size(), SEGMENTED_PAGE_SIZE);
        assert!(rep.component(CodeSigningSlot::CodeDirectory).unwrap().is_none());
        assert!(rep.format().starts_with("Mach-O thin"));

        // Unsigned code still identifies.
        let ident = rep.identification().unwrap();
        assert_eq!(ident.len(), 32);
        assert_eq!(ident, rep.identification().unwrap());
    }

    #[test]
    fn thin_signed_components() {
        let sig = test_signature();
        let (_dir, path) = write_temp(&signed_thin_macho(CPU_TYPE_ARM64, &sig));
        let rep = MachORep::from_path(&path).unwrap();

        let cd = rep.component(CodeSigningSlot::CodeDirectory).unwrap().unwrap();
        assert_eq!(
            cd,
            create_blob(CodeSigningMagic::CodeDirectory, b"directory bytes").unwrap()
        );

        // Queries are idempotent.
        assert_eq!(rep.component(CodeSigningSlot::CodeDirectory).unwrap(), Some(cd));
        assert!(rep.component(CodeSigningSlot::Entitlements).unwrap().is_none());

        // Signing range ends where the signature begins.
        assert_eq!(rep.signing_limit().unwrap(), 512);
    }

    #[test]
    fn universal_default_is_first_slice() {
        let fat = fat_macho(&[
            (CPU_TYPE_X86_64, thin_macho(CPU_TYPE_X86_64)),
            (CPU_TYPE_ARM64, thin_macho(CPU_TYPE_ARM64)),
        ]);
        let (_dir, path) = write_temp(&fat);

        let rep = MachORep::from_path(&path).unwrap();
        assert_eq!(rep.signing_base(), 4096);
        assert_eq!(rep.arch().cpu_type, CPU_TYPE_X86_64);
    }

    #[test]
    fn universal_arch_selection() {
        let fat = fat_macho(&[
            (CPU_TYPE_X86_64, thin_macho(CPU_TYPE_X86_64)),
            (CPU_TYPE_ARM64, thin_macho(CPU_TYPE_ARM64)),
        ]);
        let (_dir, path) = write_temp(&fat);

        let ctx = Context::with_arch(Architecture::arm64());
        let rep = MachORep::from_path_with_context(&path, &ctx).unwrap();
        assert_eq!(rep.signing_base(), 8192);
        assert_eq!(rep.arch().cpu_type, CPU_TYPE_ARM64);
        assert!(rep.format().starts_with("Mach-O universal"));
    }

    #[test]
    fn universal_offset_beats_arch() {
        let fat = fat_macho(&[
            (CPU_TYPE_X86_64, thin_macho(CPU_TYPE_X86_64)),
            (CPU_TYPE_ARM64, thin_macho(CPU_TYPE_ARM64)),
        ]);
        let (_dir, path) = write_temp(&fat);

        let ctx = Context {
            arch: Some(Architecture::x86_64()),
            offset: 8192,
            file_only: false,
        };
        let rep = MachORep::from_path_with_context(&path, &ctx).unwrap();
        assert_eq!(rep.arch().cpu_type, CPU_TYPE_ARM64);
    }

    #[test]
    fn universal_missing_arch_errors() {
        let fat = fat_macho(&[(CPU_TYPE_X86_64, thin_macho(CPU_TYPE_X86_64))]);
        let (_dir, path) = write_temp(&fat);

        let ctx = Context::with_arch(Architecture::arm64());
        assert!(matches!(
            MachORep::from_path_with_context(&path, &ctx),
            Err(CodeIdentityError::ArchitectureNotFound(_))
        ));
    }

    #[test]
    fn universal_bad_offset_errors() {
        let fat = fat_macho(&[(CPU_TYPE_X86_64, thin_macho(CPU_TYPE_X86_64))]);
        let (_dir, path) = write_temp(&fat);

        assert!(matches!(
            MachORep::from_path_at_offset(&path, 100),
            Err(CodeIdentityError::SliceNotFound(100))
        ));
    }

    #[test]
    fn flush_rereads_from_disk() {
        let (_dir, path) = write_temp(&thin_macho(CPU_TYPE_X86_64));
        let rep = MachORep::from_path(&path).unwrap();
        let before = rep.identification().unwrap();

        rep.flush();
        assert_eq!(rep.identification().unwrap(), before);
    }
}
