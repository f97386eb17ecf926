// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Embedded signature primitives: special slots, blob headers, superblobs.
//!
//! Code signature data lives in a *SuperBlob*: a header announcing a magic,
//! a total length and a count, followed by an index of (slot, offset) pairs
//! and then the individual blobs. Slots are the sole addressing scheme
//! between a disk representation and its consumers; this module defines the
//! closed slot enumeration and just enough superblob parsing to fetch and
//! store slot payloads. Deep parsing of individual blob types is the concern
//! of other layers.

use {
    crate::error::CodeIdentityError,
    scroll::{IOwrite, Pread},
    std::{borrow::Cow, cmp::Ordering, fmt::Display, io::Write},
};

/// Header magic for the various code signing payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodeSigningMagic {
    /// Code requirement blob.
    Requirement,
    /// Requirement set blob.
    RequirementSet,
    /// CodeDirectory blob.
    CodeDirectory,
    /// Embedded signature superblob.
    EmbeddedSignature,
    /// Old-style embedded signature.
    EmbeddedSignatureOld,
    /// Entitlements blob.
    Entitlements,
    /// DER encoded entitlements blob.
    EntitlementsDer,
    /// Multi-arch collection of embedded signatures.
    DetachedSignature,
    /// Generic blob wrapper (carries the CMS signature).
    BlobWrapper,
    /// Unknown magic.
    Unknown(u32),
}

impl From<u32> for CodeSigningMagic {
    fn from(v: u32) -> Self {
        match v {
            0xfade0c00 => Self::Requirement,
            0xfade0c01 => Self::RequirementSet,
            0xfade0c02 => Self::CodeDirectory,
            0xfade0cc0 => Self::EmbeddedSignature,
            0xfade0b02 => Self::EmbeddedSignatureOld,
            0xfade7171 => Self::Entitlements,
            0xfade7172 => Self::EntitlementsDer,
            0xfade0cc1 => Self::DetachedSignature,
            0xfade0b01 => Self::BlobWrapper,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningMagic> for u32 {
    fn from(magic: CodeSigningMagic) -> u32 {
        match magic {
            CodeSigningMagic::Requirement => 0xfade0c00,
            CodeSigningMagic::RequirementSet => 0xfade0c01,
            CodeSigningMagic::CodeDirectory => 0xfade0c02,
            CodeSigningMagic::EmbeddedSignature => 0xfade0cc0,
            CodeSigningMagic::EmbeddedSignatureOld => 0xfade0b02,
            CodeSigningMagic::Entitlements => 0xfade7171,
            CodeSigningMagic::EntitlementsDer => 0xfade7172,
            CodeSigningMagic::DetachedSignature => 0xfade0cc1,
            CodeSigningMagic::BlobWrapper => 0xfade0b01,
            CodeSigningMagic::Unknown(v) => v,
        }
    }
}

/// A well-known slot within code signing data.
///
/// Slots are a closed, versioned index shared with the code directory
/// format. Disk representations and writers speak only in these identifiers
/// plus raw byte payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CodeSigningSlot {
    CodeDirectory,
    Info,
    RequirementSet,
    ResourceDir,
    Application,
    Entitlements,
    RepSpecific,
    EntitlementsDer,
    AlternateCodeDirectory0,
    AlternateCodeDirectory1,
    AlternateCodeDirectory2,
    AlternateCodeDirectory3,
    AlternateCodeDirectory4,
    Signature,
    Identification,
    Ticket,
    Unknown(u32),
}

impl From<u32> for CodeSigningSlot {
    fn from(v: u32) -> Self {
        match v {
            0 => Self::CodeDirectory,
            1 => Self::Info,
            2 => Self::RequirementSet,
            3 => Self::ResourceDir,
            4 => Self::Application,
            5 => Self::Entitlements,
            6 => Self::RepSpecific,
            7 => Self::EntitlementsDer,
            0x1000 => Self::AlternateCodeDirectory0,
            0x1001 => Self::AlternateCodeDirectory1,
            0x1002 => Self::AlternateCodeDirectory2,
            0x1003 => Self::AlternateCodeDirectory3,
            0x1004 => Self::AlternateCodeDirectory4,
            0x10000 => Self::Signature,
            0x10001 => Self::Identification,
            0x10002 => Self::Ticket,
            _ => Self::Unknown(v),
        }
    }
}

impl From<CodeSigningSlot> for u32 {
    fn from(v: CodeSigningSlot) -> Self {
        match v {
            CodeSigningSlot::CodeDirectory => 0,
            CodeSigningSlot::Info => 1,
            CodeSigningSlot::RequirementSet => 2,
            CodeSigningSlot::ResourceDir => 3,
            CodeSigningSlot::Application => 4,
            CodeSigningSlot::Entitlements => 5,
            CodeSigningSlot::RepSpecific => 6,
            CodeSigningSlot::EntitlementsDer => 7,
            CodeSigningSlot::AlternateCodeDirectory0 => 0x1000,
            CodeSigningSlot::AlternateCodeDirectory1 => 0x1001,
            CodeSigningSlot::AlternateCodeDirectory2 => 0x1002,
            CodeSigningSlot::AlternateCodeDirectory3 => 0x1003,
            CodeSigningSlot::AlternateCodeDirectory4 => 0x1004,
            CodeSigningSlot::Signature => 0x10000,
            CodeSigningSlot::Identification => 0x10001,
            CodeSigningSlot::Ticket => 0x10002,
            CodeSigningSlot::Unknown(v) => v,
        }
    }
}

impl PartialOrd for CodeSigningSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CodeSigningSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        u32::from(*self).cmp(&u32::from(*other))
    }
}

impl CodeSigningSlot {
    /// Whether this slot's content lives outside the signature itself.
    ///
    /// External-content slots (Info.plist, CodeResources) are sealed by
    /// digest but fetched from files, so signature substitution layers must
    /// never claim them.
    pub fn has_external_content(&self) -> bool {
        matches!(self, Self::Info | Self::ResourceDir)
    }
}

/// A digest algorithm used for code signing digests.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DigestType {
    None,
    Sha1,
    Sha256,
    Sha256Truncated,
    Sha384,
    Sha512,
    Unknown(u8),
}

impl Default for DigestType {
    fn default() -> Self {
        Self::Sha256
    }
}

impl From<u8> for DigestType {
    fn from(v: u8) -> Self {
        match v {
            0 => Self::None,
            1 => Self::Sha1,
            2 => Self::Sha256,
            3 => Self::Sha256Truncated,
            4 => Self::Sha384,
            5 => Self::Sha512,
            _ => Self::Unknown(v),
        }
    }
}

impl From<DigestType> for u8 {
    fn from(v: DigestType) -> u8 {
        match v {
            DigestType::None => 0,
            DigestType::Sha1 => 1,
            DigestType::Sha256 => 2,
            DigestType::Sha256Truncated => 3,
            DigestType::Sha384 => 4,
            DigestType::Sha512 => 5,
            DigestType::Unknown(v) => v,
        }
    }
}

impl Display for DigestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Sha1 => f.write_str("sha1"),
            Self::Sha256 => f.write_str("sha256"),
            Self::Sha256Truncated => f.write_str("sha256-truncated"),
            Self::Sha384 => f.write_str("sha384"),
            Self::Sha512 => f.write_str("sha512"),
            Self::Unknown(v) => f.write_fmt(format_args!("unknown: {}", v)),
        }
    }
}

impl DigestType {
    /// Obtain a hasher for this digest type.
    pub fn as_hasher(&self) -> Result<ring::digest::Context, CodeIdentityError> {
        match self {
            Self::Sha1 => Ok(ring::digest::Context::new(
                &ring::digest::SHA1_FOR_LEGACY_USE_ONLY,
            )),
            Self::Sha256 | Self::Sha256Truncated => {
                Ok(ring::digest::Context::new(&ring::digest::SHA256))
            }
            Self::Sha384 => Ok(ring::digest::Context::new(&ring::digest::SHA384)),
            Self::Sha512 => Ok(ring::digest::Context::new(&ring::digest::SHA512)),
            Self::None | Self::Unknown(_) => Err(CodeIdentityError::DigestUnknownAlgorithm),
        }
    }

    /// Digest data with this algorithm.
    pub fn digest_data(&self, data: &[u8]) -> Result<Vec<u8>, CodeIdentityError> {
        let mut hasher = self.as_hasher()?;
        hasher.update(data);

        let mut digest = hasher.finish().as_ref().to_vec();

        if matches!(self, Self::Sha256Truncated) {
            digest.truncate(20);
        }

        Ok(digest)
    }
}

/// A digest value as stored in code signing structures.
#[derive(Clone)]
pub struct Digest<'a> {
    pub data: Cow<'a, [u8]>,
}

impl<'a> Digest<'a> {
    /// Whether this is the null digest (all zeroes).
    pub fn is_null(&self) -> bool {
        self.data.iter().all(|b| *b == 0)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.data.to_vec()
    }

    pub fn to_owned(&self) -> Digest<'static> {
        Digest {
            data: Cow::Owned(self.data.clone().into_owned()),
        }
    }
}

impl<'a> std::fmt::Debug for Digest<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(&self.data))
    }
}

impl<'a> From<Vec<u8>> for Digest<'a> {
    fn from(v: Vec<u8>) -> Self {
        Self { data: v.into() }
    }
}

/// Read the header of a blob: u32 magic and u32 total length, big-endian.
pub(crate) fn read_blob_header(data: &[u8]) -> Result<(u32, usize, &[u8]), scroll::Error> {
    let magic = data.pread_with(0, scroll::BE)?;
    let length = data.pread_with::<u32>(4, scroll::BE)?;

    Ok((magic, length as usize, &data[8..]))
}

pub(crate) fn read_and_validate_blob_header<'a>(
    data: &'a [u8],
    expected_magic: u32,
    what: &'static str,
) -> Result<&'a [u8], CodeIdentityError> {
    let (magic, _, payload) = read_blob_header(data)?;

    if magic != expected_magic {
        Err(CodeIdentityError::BadMagic(what))
    } else {
        Ok(payload)
    }
}

/// Wrap a payload in a blob header with the given magic.
pub fn create_blob(magic: CodeSigningMagic, payload: &[u8]) -> Result<Vec<u8>, CodeIdentityError> {
    let mut res = Vec::with_capacity(payload.len() + 8);
    res.iowrite_with(u32::from(magic), scroll::BE)?;
    res.iowrite_with(payload.len() as u32 + 8, scroll::BE)?;
    res.write_all(payload)?;

    Ok(res)
}

/// Create the binary content for a superblob from already-serialized blobs.
///
/// Each entry is a (slot, full blob bytes) pair. Entries should be sorted by
/// slot for a canonical encoding; this function preserves the given order.
pub fn create_superblob<'a>(
    magic: CodeSigningMagic,
    blobs: impl Iterator<Item = &'a (CodeSigningSlot, Vec<u8>)>,
) -> Result<Vec<u8>, CodeIdentityError> {
    let blobs = blobs.collect::<Vec<_>>();

    // Magic + total length + count, then 8 bytes per index entry.
    let mut total_length: u32 = 4 + 4 + 4 + 8 * blobs.len() as u32;

    let mut indices = Vec::with_capacity(blobs.len());
    let mut blob_data = Vec::with_capacity(blobs.len());

    for (slot, data) in blobs {
        indices.push((u32::from(*slot), total_length));
        total_length += data.len() as u32;
        blob_data.push(data);
    }

    let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
    cursor.iowrite_with(u32::from(magic), scroll::BE)?;
    cursor.iowrite_with(total_length, scroll::BE)?;
    cursor.iowrite_with(indices.len() as u32, scroll::BE)?;
    for (typ, offset) in indices {
        cursor.iowrite_with(typ, scroll::BE)?;
        cursor.iowrite_with(offset, scroll::BE)?;
    }
    for data in blob_data {
        cursor.write_all(data)?;
    }

    Ok(cursor.into_inner())
}

/// A single blob as located by a superblob index entry.
///
/// The blob data is unparsed; `data` holds the full blob, header included.
#[derive(Clone)]
pub struct BlobEntry<'a> {
    /// Position within the superblob index.
    pub index: usize,

    /// The slot this blob occupies.
    pub slot: CodeSigningSlot,

    /// Start offset of this blob within the superblob.
    pub offset: usize,

    /// Magic at the beginning of the blob.
    pub magic: CodeSigningMagic,

    /// Total blob length, header included.
    pub length: usize,

    /// The raw blob data, header included.
    pub data: &'a [u8],
}

impl<'a> std::fmt::Debug for BlobEntry<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("BlobEntry")
            .field("index", &self.index)
            .field("slot", &self.slot)
            .field("offset", &self.offset)
            .field("magic", &self.magic)
            .field("length", &self.length)
            .finish()
    }
}

impl<'a> BlobEntry<'a> {
    /// The payload of this blob, without the 8 byte header.
    pub fn payload(&self) -> Result<&'a [u8], CodeIdentityError> {
        Ok(read_blob_header(self.data)?.2)
    }

    /// Digest the full blob bytes with the given algorithm.
    pub fn digest_with(&self, digest_type: DigestType) -> Result<Vec<u8>, CodeIdentityError> {
        digest_type.digest_data(self.data)
    }
}

/// A lightly parsed superblob.
///
/// This is a read-only view over signature data as found in a Mach-O
/// `__LINKEDIT` segment, a detached signature file, or a bundle
/// `_CodeSignature` directory member.
pub struct EmbeddedSignature<'a> {
    /// Magic value from the header.
    pub magic: CodeSigningMagic,
    /// Total advertised length of the superblob.
    pub length: u32,
    /// Number of blobs within.
    pub count: u32,
    /// Raw data backing this superblob.
    pub data: &'a [u8],
    /// Index entries for the contained blobs.
    pub blobs: Vec<BlobEntry<'a>>,
}

impl<'a> std::fmt::Debug for EmbeddedSignature<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("EmbeddedSignature")
            .field("magic", &self.magic)
            .field("length", &self.length)
            .field("count", &self.count)
            .field("blobs", &self.blobs)
            .finish()
    }
}

impl<'a> EmbeddedSignature<'a> {
    /// Parse a superblob with [CodeSigningMagic::EmbeddedSignature] magic.
    pub fn from_bytes(data: &'a [u8]) -> Result<Self, CodeIdentityError> {
        Self::from_bytes_with_magic(data, CodeSigningMagic::EmbeddedSignature)
    }

    /// Parse a superblob, requiring the given header magic.
    pub fn from_bytes_with_magic(
        data: &'a [u8],
        expected: CodeSigningMagic,
    ) -> Result<Self, CodeIdentityError> {
        let offset = &mut 0;

        let magic: CodeSigningMagic = data.gread_with::<u32>(offset, scroll::BE)?.into();
        if magic != expected {
            return Err(CodeIdentityError::BadMagic("superblob"));
        }

        let length = data.gread_with(offset, scroll::BE)?;
        let count: u32 = data.gread_with(offset, scroll::BE)?;

        // Each index entry occupies 8 bytes. A count the input cannot hold
        // is lying; reject it before sizing the allocation from it.
        if (count as usize).saturating_mul(8) > data.len().saturating_sub(*offset) {
            return Err(CodeIdentityError::SuperblobMalformed);
        }

        let mut indices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let typ = data.gread_with::<u32>(offset, scroll::BE)?;
            let blob_offset = data.gread_with::<u32>(offset, scroll::BE)?;
            indices.push((typ, blob_offset as usize));
        }

        // The index doesn't record blob lengths. Each blob's header does,
        // but we bound every slice by the next index entry (or the end of
        // input) first so a lying length can't overrun.
        let mut blobs = Vec::with_capacity(indices.len());

        for (i, (typ, blob_offset)) in indices.iter().enumerate() {
            let end_offset = if i == indices.len() - 1 {
                data.len()
            } else {
                indices[i + 1].1
            };

            if *blob_offset > end_offset || end_offset > data.len() {
                return Err(CodeIdentityError::SuperblobMalformed);
            }

            let full_slice = &data[*blob_offset..end_offset];
            let (blob_magic, blob_length, _) = read_blob_header(full_slice)?;

            let blob_data = match blob_length.cmp(&full_slice.len()) {
                Ordering::Greater => return Err(CodeIdentityError::SuperblobMalformed),
                Ordering::Equal => full_slice,
                Ordering::Less => &full_slice[0..blob_length],
            };

            blobs.push(BlobEntry {
                index: i,
                slot: (*typ).into(),
                offset: *blob_offset,
                magic: blob_magic.into(),
                length: blob_length,
                data: blob_data,
            });
        }

        Ok(Self {
            magic,
            length,
            count,
            data,
            blobs,
        })
    }

    /// Find the first occurrence of the specified slot.
    pub fn find_slot(&self, slot: CodeSigningSlot) -> Option<&BlobEntry<'a>> {
        self.blobs.iter().find(|e| e.slot == slot)
    }

    /// Obtain the full blob bytes for a slot, if present.
    pub fn slot_data(&self, slot: CodeSigningSlot) -> Option<Vec<u8>> {
        self.find_slot(slot).map(|e| e.data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn superblob_roundtrip() {
        let cd = create_blob(CodeSigningMagic::CodeDirectory, b"fake code directory").unwrap();
        let sig = create_blob(CodeSigningMagic::BlobWrapper, b"fake cms").unwrap();

        let blobs = vec![
            (CodeSigningSlot::CodeDirectory, cd.clone()),
            (CodeSigningSlot::Signature, sig),
        ];

        let superblob = create_superblob(CodeSigningMagic::EmbeddedSignature, blobs.iter()).unwrap();

        let parsed = EmbeddedSignature::from_bytes(&superblob).unwrap();
        assert_eq!(parsed.count, 2);
        assert_eq!(parsed.length as usize, superblob.len());

        let entry = parsed.find_slot(CodeSigningSlot::CodeDirectory).unwrap();
        assert_eq!(entry.data, cd.as_slice());
        assert_eq!(entry.payload().unwrap(), b"fake code directory");

        assert!(parsed.find_slot(CodeSigningSlot::Entitlements).is_none());
    }

    #[test]
    fn superblob_bad_magic() {
        let blob = create_blob(CodeSigningMagic::Requirement, b"").unwrap();
        assert!(matches!(
            EmbeddedSignature::from_bytes(&blob),
            Err(CodeIdentityError::BadMagic(_))
        ));
    }

    #[test]
    fn absurd_blob_count_is_an_error() {
        let cd = create_blob(CodeSigningMagic::CodeDirectory, b"cd").unwrap();
        let mut superblob = create_superblob(
            CodeSigningMagic::EmbeddedSignature,
            [(CodeSigningSlot::CodeDirectory, cd)].iter(),
        )
        .unwrap();

        // The count is the third u32 of the header.
        superblob[8..12].copy_from_slice(&u32::MAX.to_be_bytes());

        assert!(matches!(
            EmbeddedSignature::from_bytes(&superblob),
            Err(CodeIdentityError::SuperblobMalformed)
        ));
    }

    #[test]
    fn slot_u32_identity() {
        for raw in [0u32, 1, 2, 3, 4, 5, 6, 7, 0x1000, 0x10000, 0x10002, 0xdead] {
            assert_eq!(u32::from(CodeSigningSlot::from(raw)), raw);
        }
    }

    #[test]
    fn external_content_slots() {
        assert!(CodeSigningSlot::Info.has_external_content());
        assert!(CodeSigningSlot::ResourceDir.has_external_content());
        assert!(!CodeSigningSlot::CodeDirectory.has_external_content());
        assert!(!CodeSigningSlot::Signature.has_external_content());
    }
}
