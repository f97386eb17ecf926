// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disk representation for arbitrary files.
//!
//! Any regular file that is not a Mach-O binary can still be identified
//! and signed as an opaque run of bytes. It stores no signature components
//! of its own; signatures for such files live detached.

use {
    crate::{
        disk_rep::{DiskRep, MONOLITHIC_PAGE_SIZE},
        embedded_signature::{CodeSigningSlot, DigestType},
        error::CodeIdentityError,
    },
    std::{
        fs::File,
        io::Read,
        path::{Path, PathBuf},
        sync::Mutex,
    },
};

/// A plain file treated as a single signable blob.
pub struct FileRep {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileRep {
    pub fn from_path(path: &Path) -> Result<Self, CodeIdentityError> {
        if !path.is_file() {
            return Err(CodeIdentityError::UnrecognizedFormat(path.to_path_buf()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(None),
        })
    }
}

impl DiskRep for FileRep {
    fn component(&self, _slot: CodeSigningSlot) -> Result<Option<Vec<u8>>, CodeIdentityError> {
        // Plain files carry no signature components.
        Ok(None)
    }

    fn identification(&self) -> Result<Vec<u8>, CodeIdentityError> {
        let metadata = std::fs::metadata(&self.path)?;

        let mut head = vec![0u8; 4096.min(metadata.len() as usize)];
        File::open(&self.path)?.read_exact(&mut head)?;
        head.extend(metadata.len().to_le_bytes());

        DigestType::Sha256.digest_data(&head)
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

    fn page_size(&self) -> usize {
        MONOLITHIC_PAGE_SIZE
    }

    fn signing_limit(&self) -> Result<u64, CodeIdentityError> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    fn format(&self) -> String {
        "generic blob".to_string()
    }

    fn fd(&self) -> Result<File, CodeIdentityError> {
        let mut cached = self.file.lock().unwrap();

        if let Some(file) = &*cached {
            return Ok(file.try_clone()?);
        }

        let file = File::open(&self.path)?;
        let handle = file.try_clone()?;
        *cached = Some(file);

        Ok(handle)
    }

    fn flush(&self) {
        *self.file.lock().unwrap() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_file_basics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.sh");
        std::fs::write(&path, b"#!/bin/sh\necho hi\n").unwrap();

        let rep = FileRep::from_path(&path).unwrap();
        assert!(rep.component(CodeSigningSlot::CodeDirectory).unwrap().is_none());
        assert!(rep.component(CodeSigningSlot::Info).unwrap().is_none());
        assert_eq!(rep.page_size(), MONOLITHIC_PAGE_SIZE);
        assert_eq!(rep.signing_limit().unwrap(), 18);
        assert_eq!(rep.signing_base(), 0);
        assert_eq!(rep.recommended_identifier().unwrap(), "script");
        assert!(!rep.main_executable_is_macho().unwrap());
    }

    #[test]
    fn identification_tracks_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");

        std::fs::write(&path, b"version one").unwrap();
        let rep = FileRep::from_path(&path).unwrap();
        let first = rep.identification().unwrap();
        assert_eq!(first, rep.identification().unwrap());

        std::fs::write(&path, b"version two").unwrap();
        assert_ne!(rep.identification().unwrap(), first);
    }

    #[test]
    fn directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FileRep::from_path(dir.path()),
            Err(CodeIdentityError::UnrecognizedFormat(_))
        ));
    }
}
