// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {std::path::PathBuf, thiserror::Error};

/// Unified error type for code identity resolution and validation.
#[derive(Debug, Error)]
pub enum CodeIdentityError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("binary parsing error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("data structure parse error: {0}")]
    Scroll(#[from] scroll::Error),

    #[error("invalid Mach-O binary: {0}")]
    InvalidBinary(String),

    #[error("unable to locate __LINKEDIT segment")]
    MissingLinkedit,

    #[error("bad header magic in {0}")]
    BadMagic(&'static str),

    #[error("SuperBlob data is malformed")]
    SuperblobMalformed,

    #[error("malformed identifier string in code directory")]
    CodeDirectoryMalformedIdentifier,

    #[error("malformed team name string in code directory")]
    CodeDirectoryMalformedTeam,

    #[error("unrecognized code object format: {0}")]
    UnrecognizedFormat(PathBuf),

    #[error("universal binary has no slice for architecture {0}")]
    ArchitectureNotFound(String),

    #[error("universal binary has no slice at offset {0}")]
    SliceNotFound(u64),

    #[error("error parsing bundle Info.plist: {0}")]
    BundleInfoPlist(#[from] plist::Error),

    #[error("bundle Info.plist is not a dictionary: {0}")]
    BundleBadInfoPlist(PathBuf),

    #[error("bundle Info.plist does not define CFBundleExecutable: {0}")]
    BundleNoMainExecutable(PathBuf),

    #[error("unknown digest algorithm")]
    DigestUnknownAlgorithm,

    #[error("detached signature data is invalid: {0}")]
    DetachedSignatureInvalid(&'static str),

    #[error("code object is not signed at all")]
    Unsigned,

    #[error("code signature lacks a CMS signature component")]
    SignatureMissing,

    #[error("the code on disk does not match its sealed identity")]
    StaticCodeChanged,

    #[error("cannot find code object on disk: {0}")]
    StaticCodeNotFound(PathBuf),

    #[error("host has no guest with the requested attributes")]
    NoSuchGuest,

    #[error("host reports that the guest is no longer valid")]
    GuestInvalid,

    #[error("ambiguous guest specification (host has multiple matching guests)")]
    MultipleGuests,
}
