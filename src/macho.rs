// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mach-O primitives used by disk representations.
//!
//! Signature data in a Mach-O binary is recorded by the `LC_CODE_SIGNATURE`
//! load command, which points into the `__LINKEDIT` segment. This module
//! locates that data, models architecture selection for universal binaries,
//! and owns the bytes of a loaded executable image.

use {
    crate::{
        embedded_signature::EmbeddedSignature,
        error::CodeIdentityError,
    },
    goblin::mach::{
        constants::{
            cputype::{get_arch_name_from_types, CPU_TYPE_ARM64, CPU_TYPE_X86_64},
            SEG_LINKEDIT,
        },
        load_command::{CommandVariant, LinkeditDataCommand},
        Mach, MachO,
    },
    std::{fmt::Display, path::Path, sync::Arc},
};

/// A CPU architecture, as used to select a slice of a universal binary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Architecture {
    pub cpu_type: u32,
    /// When `None`, any subtype of the CPU type matches.
    pub cpu_subtype: Option<u32>,
}

impl Architecture {
    pub fn new(cpu_type: u32, cpu_subtype: Option<u32>) -> Self {
        Self {
            cpu_type,
            cpu_subtype,
        }
    }

    pub fn x86_64() -> Self {
        Self::new(CPU_TYPE_X86_64, None)
    }

    pub fn arm64() -> Self {
        Self::new(CPU_TYPE_ARM64, None)
    }

    /// Whether a parsed Mach-O belongs to this architecture.
    pub fn matches_macho(&self, macho: &MachO) -> bool {
        macho.header.cputype == self.cpu_type
            && self
                .cpu_subtype
                .map(|st| macho.header.cpusubtype == st)
                .unwrap_or(true)
    }
}

impl Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match get_arch_name_from_types(self.cpu_type, self.cpu_subtype.unwrap_or(0)) {
            Some(name) => f.write_str(name),
            None => f.write_fmt(format_args!(
                "unknown ({}:{})",
                self.cpu_type,
                self.cpu_subtype.unwrap_or(0)
            )),
        }
    }
}

/// A slice of a universal binary: an architecture and its byte range.
#[derive(Clone, Copy, Debug)]
pub struct ImageSlice {
    pub arch: Architecture,
    pub offset: u64,
    pub size: u64,
}

/// Extensions over a parsed Mach-O binary for signature access.
pub trait MachOSignature {
    /// The `LC_CODE_SIGNATURE` load command, if present.
    fn code_signature_load_command(&self) -> Option<LinkeditDataCommand>;

    /// Raw signature superblob bytes, if the binary has any.
    fn code_signature_data(&self) -> Result<Option<&[u8]>, CodeIdentityError>;

    /// The parsed embedded signature, if the binary has one.
    fn code_signature(&self) -> Result<Option<EmbeddedSignature<'_>>, CodeIdentityError>;

    /// Offset within this slice where signable code ends.
    ///
    /// For a signed binary this is the start of the signature data. `None`
    /// means the binary is unsigned and the whole slice is signable.
    fn code_limit_offset(&self) -> Option<u64>;
}

impl<'a> MachOSignature for MachO<'a> {
    fn code_signature_load_command(&self) -> Option<LinkeditDataCommand> {
        self.load_commands.iter().find_map(|lc| {
            if let CommandVariant::CodeSignature(command) = lc.command {
                Some(command)
            } else {
                None
            }
        })
    }

    fn code_signature_data(&self) -> Result<Option<&[u8]>, CodeIdentityError> {
        let command = match self.code_signature_load_command() {
            Some(command) => command,
            None => return Ok(None),
        };

        // The load command points into the __LINKEDIT segment.
        let linkedit = self
            .segments
            .iter()
            .find(|segment| matches!(segment.name(), Ok(SEG_LINKEDIT)))
            .ok_or(CodeIdentityError::MissingLinkedit)?;

        if (command.dataoff as u64) < linkedit.fileoff {
            return Err(CodeIdentityError::InvalidBinary(
                "code signature data begins before __LINKEDIT segment".into(),
            ));
        }

        let start = (command.dataoff as u64 - linkedit.fileoff) as usize;
        let end = start.saturating_add(command.datasize as usize);

        linkedit.data.get(start..end).map(Some).ok_or_else(|| {
            CodeIdentityError::InvalidBinary(format!(
                "code signature data range {}..{} exceeds __LINKEDIT segment size {}",
                start,
                end,
                linkedit.data.len()
            ))
        })
    }

    fn code_signature(&self) -> Result<Option<EmbeddedSignature<'_>>, CodeIdentityError> {
        match self.code_signature_data()? {
            Some(data) => Ok(Some(EmbeddedSignature::from_bytes(data)?)),
            None => Ok(None),
        }
    }

    fn code_limit_offset(&self) -> Option<u64> {
        self.code_signature_load_command()
            .map(|command| command.dataoff as u64)
    }
}

/// The bytes of a main executable, loaded into memory.
///
/// Owns the data so parsed views can be re-derived on demand without holding
/// self-referential lifetimes.
#[derive(Clone)]
pub struct MainExecutableImage {
    data: Arc<Vec<u8>>,
}

impl MainExecutableImage {
    pub fn from_path(path: &Path) -> Result<Self, CodeIdentityError> {
        Ok(Self {
            data: Arc::new(std::fs::read(path)?),
        })
    }

    pub fn from_data(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn parse(&self) -> Result<Mach<'_>, CodeIdentityError> {
        Ok(Mach::parse(&self.data)?)
    }

    pub fn is_universal(&self) -> Result<bool, CodeIdentityError> {
        Ok(matches!(self.parse()?, Mach::Fat(_)))
    }

    /// Enumerate the slices of this image.
    ///
    /// A thin binary yields a single slice spanning the whole file.
    pub fn slices(&self) -> Result<Vec<ImageSlice>, CodeIdentityError> {
        match self.parse()? {
            Mach::Binary(macho) => Ok(vec![ImageSlice {
                arch: Architecture::new(macho.header.cputype, Some(macho.header.cpusubtype)),
                offset: 0,
                size: self.data.len() as u64,
            }]),
            Mach::Fat(multiarch) => {
                let mut slices = Vec::new();
                for arch in multiarch.iter_arches() {
                    let arch = arch?;
                    slices.push(ImageSlice {
                        arch: Architecture::new(arch.cputype, Some(arch.cpusubtype)),
                        offset: arch.offset as u64,
                        size: arch.size as u64,
                    });
                }
                Ok(slices)
            }
        }
    }

    /// Find the slice for an architecture.
    pub fn find_slice(&self, arch: &Architecture) -> Result<Option<ImageSlice>, CodeIdentityError> {
        Ok(self.slices()?.into_iter().find(|slice| {
            slice.arch.cpu_type == arch.cpu_type
                && arch
                    .cpu_subtype
                    .map(|st| slice.arch.cpu_subtype == Some(st))
                    .unwrap_or(true)
        }))
    }

    /// Find the slice starting at an exact file offset.
    pub fn slice_at_offset(&self, offset: u64) -> Result<Option<ImageSlice>, CodeIdentityError> {
        Ok(self.slices()?.into_iter().find(|s| s.offset == offset))
    }
}

impl std::fmt::Debug for MainExecutableImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainExecutableImage")
            .field("len", &self.data.len())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use {
        super::{fixtures::*, *},
        crate::embedded_signature::{
            create_blob, create_superblob, CodeSigningMagic, CodeSigningSlot,
        },
    };

    #[test]
    fn thin_slice_enumeration() {
        let image = MainExecutableImage::from_data(thin_macho(CPU_TYPE_X86_64));
        assert!(!image.is_universal().unwrap());

        let slices = image.slices().unwrap();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].offset, 0);
        assert_eq!(slices[0].arch.cpu_type, CPU_TYPE_X86_64);
    }

    #[test]
    fn universal_slice_selection() {
        let image = MainExecutableImage::from_data(fat_macho(&[
            (CPU_TYPE_X86_64, thin_macho(CPU_TYPE_X86_64)),
            (CPU_TYPE_ARM64, thin_macho(CPU_TYPE_ARM64)),
        ]));
        assert!(image.is_universal().unwrap());

        let slices = image.slices().unwrap();
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].offset, 4096);
        assert_eq!(slices[1].offset, 8192);

        let arm = image.find_slice(&Architecture::arm64()).unwrap().unwrap();
        assert_eq!(arm.offset, 8192);

        assert!(image.slice_at_offset(8192).unwrap().is_some());
        assert!(image.slice_at_offset(100).unwrap().is_none());
    }

    #[test]
    fn signature_location() {
        let cd = create_blob(CodeSigningMagic::CodeDirectory, b"cd").unwrap();
        let superblob = create_superblob(
            CodeSigningMagic::EmbeddedSignature,
            [(CodeSigningSlot::CodeDirectory, cd)].iter(),
        )
        .unwrap();

        let data = signed_thin_macho(CPU_TYPE_ARM64, &superblob);
        let macho = match Mach::parse(&data).unwrap() {
            Mach::Binary(macho) => macho,
            Mach::Fat(_) => panic!("expected thin binary"),
        };

        assert_eq!(macho.code_limit_offset(), Some(512));

        let signature = macho.code_signature().unwrap().unwrap();
        assert_eq!(signature.count, 1);
        assert!(signature.find_slot(CodeSigningSlot::CodeDirectory).is_some());
    }

    #[test]
    fn signature_range_outside_linkedit_is_an_error() {
        let superblob = create_superblob(
            CodeSigningMagic::EmbeddedSignature,
            [(
                CodeSigningSlot::CodeDirectory,
                create_blob(CodeSigningMagic::CodeDirectory, b"cd").unwrap(),
            )]
            .iter(),
        )
        .unwrap();

        let mut data = signed_thin_macho(CPU_TYPE_ARM64, &superblob);
        // Lie about the signature size in the load command: datasize lives
        // after the header (32), the segment command (72) and the first
        // three fields of LC_CODE_SIGNATURE (12).
        data[116..120].copy_from_slice(&0x10000000u32.to_le_bytes());

        let macho = match Mach::parse(&data).unwrap() {
            Mach::Binary(macho) => macho,
            Mach::Fat(_) => panic!("expected thin binary"),
        };

        assert!(matches!(
            macho.code_signature_data(),
            Err(CodeIdentityError::InvalidBinary(_))
        ));
    }

    #[test]
    fn unsigned_binary_has_no_signature() {
        let data = thin_macho(CPU_TYPE_X86_64);
        let macho = match Mach::parse(&data).unwrap() {
            Mach::Binary(macho) => macho,
            Mach::Fat(_) => panic!("expected thin binary"),
        };

        assert!(macho.code_signature().unwrap().is_none());
        assert_eq!(macho.code_limit_offset(), None);
    }
}
