// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Code directory data structure parsing and construction.
//!
//! The code directory describes the contents of a signed entity: an
//! identifier, flags, digests of the code pages and of the special slot
//! content. All integers are big-endian and all offsets are relative to
//! the start of the blob.

use {
    crate::{
        embedded_signature::{
            create_blob, read_and_validate_blob_header, CodeSigningMagic, CodeSigningSlot, Digest,
            DigestType,
        },
        error::CodeIdentityError,
    },
    bitflags::bitflags,
    scroll::{IOwrite, Pread},
    std::{collections::BTreeMap, io::Write},
};

bitflags! {
    /// Code signature flags, as stored in a code directory.
    pub struct CodeSignatureFlags: u32 {
        /// Code may act as a host hosting guests.
        const HOST = 0x1;
        /// The signature is ad-hoc (no CMS signature present).
        const ADHOC = 0x2;
        /// Set the "hard" status bit at launch.
        const FORCE_HARD = 0x100;
        /// Set the "kill" status bit at launch.
        const FORCE_KILL = 0x200;
        /// Force certificate expiration checks.
        const FORCE_EXPIRATION = 0x400;
        /// Restrict dyld loading.
        const RESTRICT = 0x800;
        /// Enforce code signing.
        const ENFORCEMENT = 0x1000;
        /// Library validation required.
        const LIBRARY_VALIDATION = 0x2000;
        /// Hardened runtime.
        const RUNTIME = 0x10000;
        /// The signature was produced by the linker.
        const LINKER_SIGNED = 0x20000;
    }
}

/// Version of the code directory format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd)]
#[repr(u32)]
pub enum CodeDirectoryVersion {
    Initial = 0x20000,
    SupportsScatter = 0x20100,
    SupportsTeamId = 0x20200,
    SupportsCodeLimit64 = 0x20300,
    SupportsExecSegment = 0x20400,
}

/// A parsed code directory blob.
///
/// Fields through format version 0x20400 are represented. Ownership of
/// strings and digests is taken on parse so the blob outlives its source
/// buffer.
#[derive(Clone, Debug, Default)]
pub struct CodeDirectoryBlob {
    /// Format version.
    pub version: u32,
    /// Option flags.
    pub flags: CodeSignatureFlags,
    /// Limit to the main image signature range, 32 bit form.
    pub code_limit: u32,
    /// Size of each digest in bytes.
    pub digest_size: u8,
    /// Digest algorithm.
    pub digest_type: DigestType,
    /// Platform identifier or 0.
    pub platform: u8,
    /// log2(page size in bytes); 0 means infinite.
    pub page_size: u8,
    /// Offset of the scatter vector or 0.
    pub scatter_offset: Option<u32>,
    /// Limit to the main image signature range, 64 bit form.
    pub code_limit_64: Option<u64>,
    /// Offset of the executable segment.
    pub exec_seg_base: Option<u64>,
    /// Limit of the executable segment.
    pub exec_seg_limit: Option<u64>,
    /// Executable segment flags.
    pub exec_seg_flags: Option<u64>,
    /// Signing identifier.
    pub ident: String,
    /// Team identifier, if present.
    pub team_name: Option<String>,
    /// Digests over the code pages, in page order.
    pub code_digests: Vec<Digest<'static>>,
    /// Digests over the special slot content, keyed by slot.
    pub special_digests: BTreeMap<CodeSigningSlot, Digest<'static>>,
}

impl Default for CodeSignatureFlags {
    fn default() -> Self {
        CodeSignatureFlags::empty()
    }
}

fn read_cstring(data: &[u8], offset: usize) -> Result<String, scroll::Error> {
    let tail = data
        .get(offset..)
        .ok_or(scroll::Error::BadOffset(offset))?;

    let len = tail
        .iter()
        .position(|b| *b == 0)
        .ok_or(scroll::Error::BadOffset(offset))?;

    Ok(String::from_utf8_lossy(&tail[..len]).into_owned())
}

impl CodeDirectoryBlob {
    /// Parse a code directory from full blob bytes (header included).
    pub fn from_blob_bytes(data: &[u8]) -> Result<Self, CodeIdentityError> {
        read_and_validate_blob_header(
            data,
            u32::from(CodeSigningMagic::CodeDirectory),
            "code directory",
        )?;

        // Offsets in the blob are relative to the blob start, so we parse
        // against the full bytes and skip past the header ourselves.
        let offset = &mut 8;

        let version = data.gread_with::<u32>(offset, scroll::BE)?;
        let flags = data.gread_with::<u32>(offset, scroll::BE)?;
        let flags = CodeSignatureFlags::from_bits_truncate(flags);
        let hash_offset = data.gread_with::<u32>(offset, scroll::BE)?;
        let ident_offset = data.gread_with::<u32>(offset, scroll::BE)?;
        let n_special_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        let n_code_slots = data.gread_with::<u32>(offset, scroll::BE)?;
        let code_limit = data.gread_with::<u32>(offset, scroll::BE)?;
        let digest_size = data.gread_with::<u8>(offset, scroll::BE)?;
        let digest_type = data.gread_with::<u8>(offset, scroll::BE)?.into();
        let platform = data.gread_with::<u8>(offset, scroll::BE)?;
        let page_size = data.gread_with::<u8>(offset, scroll::BE)?;
        let _spare2 = data.gread_with::<u32>(offset, scroll::BE)?;

        let scatter_offset = if version >= CodeDirectoryVersion::SupportsScatter as u32 {
            let v = data.gread_with::<u32>(offset, scroll::BE)?;
            if v != 0 {
                Some(v)
            } else {
                None
            }
        } else {
            None
        };
        let team_offset = if version >= CodeDirectoryVersion::SupportsTeamId as u32 {
            let v = data.gread_with::<u32>(offset, scroll::BE)?;
            if v != 0 {
                Some(v)
            } else {
                None
            }
        } else {
            None
        };
        let (code_limit_64, exec_seg_base, exec_seg_limit, exec_seg_flags) =
            if version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32 {
                let _spare3 = data.gread_with::<u32>(offset, scroll::BE)?;
                let code_limit_64 = data.gread_with::<u64>(offset, scroll::BE)?;
                let code_limit_64 = if code_limit_64 != 0 {
                    Some(code_limit_64)
                } else {
                    None
                };

                if version >= CodeDirectoryVersion::SupportsExecSegment as u32 {
                    let base = data.gread_with::<u64>(offset, scroll::BE)?;
                    let limit = data.gread_with::<u64>(offset, scroll::BE)?;
                    let seg_flags = data.gread_with::<u64>(offset, scroll::BE)?;
                    (
                        code_limit_64,
                        Some(base),
                        Some(limit),
                        if seg_flags != 0 { Some(seg_flags) } else { None },
                    )
                } else {
                    (code_limit_64, None, None, None)
                }
            } else {
                (None, None, None, None)
            };

        let ident = read_cstring(data, ident_offset as usize)
            .map_err(|_| CodeIdentityError::CodeDirectoryMalformedIdentifier)?;

        let team_name = match team_offset {
            Some(off) => Some(
                read_cstring(data, off as usize)
                    .map_err(|_| CodeIdentityError::CodeDirectoryMalformedTeam)?,
            ),
            None => None,
        };

        let digest_size = digest_size as usize;
        let get_digest = |index: isize| -> Result<Digest<'static>, CodeIdentityError> {
            let start = hash_offset as isize + index * digest_size as isize;
            if start < 0 || start as usize + digest_size > data.len() {
                return Err(CodeIdentityError::SuperblobMalformed);
            }
            let start = start as usize;
            Ok(Digest::from(data[start..start + digest_size].to_vec()))
        };

        // Special slot digests are stored in negative index order: slot n's
        // digest lives n positions before hash_offset.
        let mut special_digests = BTreeMap::new();
        for i in 0..n_special_slots {
            let slot = CodeSigningSlot::from(i + 1);
            special_digests.insert(slot, get_digest(-(i as isize + 1))?);
        }

        // A slot count the input cannot possibly hold is lying; reject it
        // before sizing the allocation from it.
        let n_code_slots = n_code_slots as usize;
        if n_code_slots.saturating_mul(digest_size.max(1))
            > data.len().saturating_sub(hash_offset as usize)
        {
            return Err(CodeIdentityError::SuperblobMalformed);
        }

        let mut code_digests = Vec::with_capacity(n_code_slots);
        for i in 0..n_code_slots {
            code_digests.push(get_digest(i as isize)?);
        }

        Ok(Self {
            version,
            flags,
            code_limit,
            digest_size: digest_size as u8,
            digest_type,
            platform,
            page_size,
            scatter_offset,
            code_limit_64,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
            ident,
            team_name,
            code_digests,
            special_digests,
        })
    }

    /// Serialize to full blob bytes, header included.
    pub fn to_blob_bytes(&self) -> Result<Vec<u8>, CodeIdentityError> {
        let version = self.effective_version();

        // Fixed field size depends on version. The base covers everything
        // through spare2: seven u32 fields plus four u8 fields plus spare2.
        let mut fixed_size: u32 = 36;
        if version >= CodeDirectoryVersion::SupportsScatter as u32 {
            fixed_size += 4;
        }
        if version >= CodeDirectoryVersion::SupportsTeamId as u32 {
            fixed_size += 4;
        }
        if version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32 {
            fixed_size += 12;
        }
        if version >= CodeDirectoryVersion::SupportsExecSegment as u32 {
            fixed_size += 24;
        }

        let ident_offset = 8 + fixed_size;
        let mut strings = Vec::new();
        strings.extend_from_slice(self.ident.as_bytes());
        strings.push(0);

        let team_offset = self.team_name.as_ref().map(|team| {
            let off = ident_offset + strings.len() as u32;
            strings.extend_from_slice(team.as_bytes());
            strings.push(0);
            off
        });

        let n_special_slots = self
            .special_digests
            .keys()
            .map(|slot| u32::from(*slot))
            .max()
            .unwrap_or(0);

        let digest_size = self.digest_size as u32;
        let hash_offset = ident_offset + strings.len() as u32 + n_special_slots * digest_size;

        let mut payload = std::io::Cursor::new(Vec::<u8>::new());
        payload.iowrite_with(version, scroll::BE)?;
        payload.iowrite_with(self.flags.bits(), scroll::BE)?;
        payload.iowrite_with(hash_offset, scroll::BE)?;
        payload.iowrite_with(ident_offset, scroll::BE)?;
        payload.iowrite_with(n_special_slots, scroll::BE)?;
        payload.iowrite_with(self.code_digests.len() as u32, scroll::BE)?;
        payload.iowrite_with(self.code_limit, scroll::BE)?;
        payload.iowrite_with(self.digest_size, scroll::BE)?;
        payload.iowrite_with(u8::from(self.digest_type), scroll::BE)?;
        payload.iowrite_with(self.platform, scroll::BE)?;
        payload.iowrite_with(self.page_size, scroll::BE)?;
        payload.iowrite_with(0u32, scroll::BE)?;

        if version >= CodeDirectoryVersion::SupportsScatter as u32 {
            payload.iowrite_with(self.scatter_offset.unwrap_or(0), scroll::BE)?;
        }
        if version >= CodeDirectoryVersion::SupportsTeamId as u32 {
            payload.iowrite_with(team_offset.unwrap_or(0), scroll::BE)?;
        }
        if version >= CodeDirectoryVersion::SupportsCodeLimit64 as u32 {
            payload.iowrite_with(0u32, scroll::BE)?;
            payload.iowrite_with(self.code_limit_64.unwrap_or(0), scroll::BE)?;
        }
        if version >= CodeDirectoryVersion::SupportsExecSegment as u32 {
            payload.iowrite_with(self.exec_seg_base.unwrap_or(0), scroll::BE)?;
            payload.iowrite_with(self.exec_seg_limit.unwrap_or(0), scroll::BE)?;
            payload.iowrite_with(self.exec_seg_flags.unwrap_or(0), scroll::BE)?;
        }

        payload.write_all(&strings)?;

        // Special digests in reverse slot order, missing slots null.
        for slot_index in (1..=n_special_slots).rev() {
            let slot = CodeSigningSlot::from(slot_index);
            match self.special_digests.get(&slot) {
                Some(digest) => payload.write_all(&digest.data)?,
                None => payload.write_all(&vec![0u8; digest_size as usize])?,
            }
        }

        for digest in &self.code_digests {
            payload.write_all(&digest.data)?;
        }

        create_blob(CodeSigningMagic::CodeDirectory, &payload.into_inner())
    }

    /// The effective size limit of the code, preferring the 64 bit form.
    pub fn effective_code_limit(&self) -> u64 {
        self.code_limit_64.unwrap_or(self.code_limit as u64)
    }

    /// Digest of a code page, if recorded.
    pub fn code_digest_at(&self, page: usize) -> Option<&Digest<'static>> {
        self.code_digests.get(page)
    }

    /// Digest sealing a special slot, if recorded and non-null.
    pub fn special_digest(&self, slot: CodeSigningSlot) -> Option<&Digest<'static>> {
        self.special_digests.get(&slot).filter(|d| !d.is_null())
    }

    /// Digest the serialized form, yielding the directory's own identity hash.
    pub fn digest_with(&self, digest_type: DigestType) -> Result<Vec<u8>, CodeIdentityError> {
        digest_type.digest_data(&self.to_blob_bytes()?)
    }

    fn effective_version(&self) -> u32 {
        let mut version = self.version.max(CodeDirectoryVersion::Initial as u32);

        if self.scatter_offset.is_some() {
            version = version.max(CodeDirectoryVersion::SupportsScatter as u32);
        }
        if self.team_name.is_some() {
            version = version.max(CodeDirectoryVersion::SupportsTeamId as u32);
        }
        if self.code_limit_64.is_some() {
            version = version.max(CodeDirectoryVersion::SupportsCodeLimit64 as u32);
        }
        if self.exec_seg_base.is_some() || self.exec_seg_limit.is_some() {
            version = version.max(CodeDirectoryVersion::SupportsExecSegment as u32);
        }

        version
    }
}

/// Incrementally construct a [CodeDirectoryBlob].
///
/// Writers use this to let callers contribute digests and flags before the
/// final directory is emitted.
pub struct CodeDirectoryBuilder {
    identifier: String,
    team_name: Option<String>,
    flags: CodeSignatureFlags,
    digest_type: DigestType,
    page_size_log2: u8,
    code_limit: u64,
    exec_seg: Option<(u64, u64, u64)>,
    special_digests: BTreeMap<CodeSigningSlot, Digest<'static>>,
    code_digests: Vec<Digest<'static>>,
}

impl CodeDirectoryBuilder {
    pub fn new(identifier: impl ToString) -> Self {
        Self {
            identifier: identifier.to_string(),
            team_name: None,
            flags: CodeSignatureFlags::ADHOC,
            digest_type: DigestType::Sha256,
            page_size_log2: 12,
            code_limit: 0,
            exec_seg: None,
            special_digests: BTreeMap::new(),
            code_digests: Vec::new(),
        }
    }

    pub fn team_name(mut self, team: impl ToString) -> Self {
        self.team_name = Some(team.to_string());
        self
    }

    pub fn flags(mut self, flags: CodeSignatureFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn add_flags(&mut self, flags: CodeSignatureFlags) {
        self.flags |= flags;
    }

    pub fn digest_type(mut self, digest_type: DigestType) -> Self {
        self.digest_type = digest_type;
        self
    }

    pub fn code_limit(mut self, limit: u64) -> Self {
        self.code_limit = limit;
        self
    }

    pub fn exec_segment(mut self, base: u64, limit: u64, flags: u64) -> Self {
        self.exec_seg = Some((base, limit, flags));
        self
    }

    /// Seal a special slot with the digest of its content.
    pub fn set_slot_content(
        &mut self,
        slot: CodeSigningSlot,
        content: &[u8],
    ) -> Result<(), CodeIdentityError> {
        let digest = self.digest_type.digest_data(content)?;
        self.special_digests.insert(slot, Digest::from(digest));
        Ok(())
    }

    /// Append the digest of the next code page.
    pub fn add_code_page(&mut self, page: &[u8]) -> Result<(), CodeIdentityError> {
        let digest = self.digest_type.digest_data(page)?;
        self.code_digests.push(Digest::from(digest));
        Ok(())
    }

    pub fn build(self) -> Result<CodeDirectoryBlob, CodeIdentityError> {
        let digest_len = self.digest_type.digest_data(b"")?.len();

        let (code_limit, code_limit_64) = if self.code_limit <= u32::MAX as u64 {
            (self.code_limit as u32, None)
        } else {
            (0, Some(self.code_limit))
        };

        let (exec_seg_base, exec_seg_limit, exec_seg_flags) = match self.exec_seg {
            Some((base, limit, flags)) => {
                (Some(base), Some(limit), if flags != 0 { Some(flags) } else { None })
            }
            None => (None, None, None),
        };

        Ok(CodeDirectoryBlob {
            version: CodeDirectoryVersion::SupportsExecSegment as u32,
            flags: self.flags,
            code_limit,
            digest_size: digest_len as u8,
            digest_type: self.digest_type,
            platform: 0,
            page_size: self.page_size_log2,
            scatter_offset: None,
            code_limit_64,
            exec_seg_base,
            exec_seg_limit,
            exec_seg_flags,
            ident: self.identifier,
            team_name: self.team_name,
            code_digests: self.code_digests,
            special_digests: self.special_digests,
        })
    }
}
