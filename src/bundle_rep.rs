// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Disk representation for bundles.
//!
//! A bundle is a directory with an `Info.plist`, a main executable named by
//! `CFBundleExecutable`, and signature components stored as individual
//! files under `_CodeSignature/`. Slot queries prefer the main
//! executable's embedded signature and fall back to the `_CodeSignature/`
//! files.

use {
    crate::{
        disk_rep::{
            best_file_guess, DiskRep, DiskRepWriter, WriterAttributes,
        },
        embedded_signature::CodeSigningSlot,
        error::CodeIdentityError,
        macho::MainExecutableImage,
        resources::ResourceBuilder,
    },
    log::{debug, info},
    std::{
        collections::BTreeMap,
        fs::File,
        path::{Path, PathBuf},
        sync::Arc,
    },
};

const SIGNATURE_DIR: &str = "_CodeSignature";

/// A bundle directory on disk.
pub struct BundleRep {
    root: PathBuf,
    /// `root/Contents` for deep bundles, `root` itself for shallow ones.
    contents: PathBuf,
    info_plist_path: PathBuf,
    info: plist::Dictionary,
    exec_path: PathBuf,
    exec_rep: Arc<dyn DiskRep>,
}

impl BundleRep {
    /// Whether a directory has the landmarks of a bundle.
    pub fn path_is_bundle(path: &Path) -> bool {
        path.join("Contents/Info.plist").is_file() || path.join("Info.plist").is_file()
    }

    pub fn from_path(path: &Path) -> Result<Self, CodeIdentityError> {
        let contents = if path.join("Contents/Info.plist").is_file() {
            path.join("Contents")
        } else {
            path.to_path_buf()
        };

        let info_plist_path = contents.join("Info.plist");

        let info = match plist::Value::from_file(&info_plist_path)? {
            plist::Value::Dictionary(dict) => dict,
            _ => return Err(CodeIdentityError::BundleBadInfoPlist(info_plist_path)),
        };

        let exec_name = info
            .get("CFBundleExecutable")
            .and_then(|v| v.as_string())
            .ok_or_else(|| CodeIdentityError::BundleNoMainExecutable(path.to_path_buf()))?;

        let exec_path = [contents.join("MacOS").join(exec_name), contents.join(exec_name)]
            .into_iter()
            .find(|p| p.is_file())
            .ok_or_else(|| CodeIdentityError::BundleNoMainExecutable(path.to_path_buf()))?;

        debug!(
            "bundle {} has main executable {}",
            path.display(),
            exec_path.display()
        );

        let exec_rep = best_file_guess(&exec_path)?;

        Ok(Self {
            root: path.to_path_buf(),
            contents,
            info_plist_path,
            info,
            exec_path,
            exec_rep,
        })
    }

    /// The representation of the bundle's main executable.
    pub fn main_executable_rep(&self) -> &Arc<dyn DiskRep> {
        &self.exec_rep
    }

    fn signature_dir(&self) -> PathBuf {
        self.contents.join(SIGNATURE_DIR)
    }

    fn exec_relative_path(&self) -> String {
        self.exec_path
            .strip_prefix(&self.contents)
            .unwrap_or(&self.exec_path)
            .to_string_lossy()
            .into_owned()
    }
}

impl DiskRep for BundleRep {
    fn component(&self, slot: CodeSigningSlot) -> Result<Option<Vec<u8>>, CodeIdentityError> {
        match slot {
            // The Info.plist is the bundle's own; never the executable's.
            CodeSigningSlot::Info => Ok(Some(std::fs::read(&self.info_plist_path)?)),
            CodeSigningSlot::ResourceDir => {
                let path = self.signature_dir().join("CodeResources");
                if path.is_file() {
                    Ok(Some(std::fs::read(path)?))
                } else {
                    Ok(None)
                }
            }
            _ => {
                if let Some(data) = self.exec_rep.component(slot)? {
                    return Ok(Some(data));
                }

                // Components the executable does not embed may be stored
                // as files under _CodeSignature/, as the bundle writer
                // lays them out.
                let path = self.signature_dir().join(slot_file_name(slot));
                if path.is_file() {
                    Ok(Some(std::fs::read(path)?))
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn identification(&self) -> Result<Vec<u8>, CodeIdentityError> {
        let mut data = std::fs::read(&self.info_plist_path)?;
        data.extend(self.exec_rep.identification()?);

        crate::embedded_signature::DigestType::Sha256.digest_data(&data)
    }

    fn main_executable_path(&self) -> PathBuf {
        self.exec_path.clone()
    }

    fn canonical_path(&self) -> PathBuf {
        self.root.clone()
    }

    fn recommended_identifier(&self) -> Result<String, CodeIdentityError> {
        if let Some(ident) = self.info.get("CFBundleIdentifier").and_then(|v| v.as_string()) {
            return Ok(ident.to_string());
        }

        self.exec_rep.recommended_identifier()
    }

    fn resources_root_path(&self) -> Option<PathBuf> {
        Some(self.contents.clone())
    }

    fn default_resource_rules(&self) -> Option<plist::Value> {
        let mut rules = plist::Dictionary::new();

        rules.insert("^Resources/".to_string(), plist::Value::Boolean(true));

        let mut lproj = plist::Dictionary::new();
        lproj.insert("weight".to_string(), plist::Value::Integer(plist::Integer::from(1000u64)));
        lproj.insert("optional".to_string(), plist::Value::Boolean(true));
        rules.insert(
            "^Resources/.*\\.lproj/".to_string(),
            plist::Value::Dictionary(lproj),
        );

        let mut locversion = plist::Dictionary::new();
        locversion.insert("weight".to_string(), plist::Value::Integer(plist::Integer::from(1100u64)));
        locversion.insert("omit".to_string(), plist::Value::Boolean(true));
        rules.insert(
            "^Resources/.*\\.lproj/locversion.plist$".to_string(),
            plist::Value::Dictionary(locversion),
        );

        let mut root = plist::Dictionary::new();
        root.insert("rules".to_string(), plist::Value::Dictionary(rules));

        Some(plist::Value::Dictionary(root))
    }

    fn adjust_resources(&self, builder: &mut ResourceBuilder) {
        // Signature artifacts and the sealed pieces themselves never count
        // as resources.
        builder.add_exclusion(format!("^{}/", SIGNATURE_DIR));
        builder.add_exclusion("^Info\\.plist$");
        builder.add_exclusion(format!("^{}$", self.exec_relative_path()));
    }

    fn main_executable_image(&self) -> Result<Option<MainExecutableImage>, CodeIdentityError> {
        self.exec_rep.main_executable_image()
    }

    fn page_size(&self) -> usize {
        self.exec_rep.page_size()
    }

    fn signing_base(&self) -> u64 {
        self.exec_rep.signing_base()
    }

    fn signing_limit(&self) -> Result<u64, CodeIdentityError> {
        self.exec_rep.signing_limit()
    }

    fn format(&self) -> String {
        format!("bundle with {}", self.exec_rep.format())
    }

    fn modified_files(&self) -> Vec<PathBuf> {
        let dir = self.signature_dir();

        vec![
            self.exec_path.clone(),
            dir.join("CodeResources"),
            dir.join("CodeDirectory"),
            dir.join("CodeRequirements"),
            dir.join("CodeSignature"),
        ]
    }

    fn fd(&self) -> Result<File, CodeIdentityError> {
        self.exec_rep.fd()
    }

    fn flush(&self) {
        self.exec_rep.flush()
    }

    fn writer(&self) -> Option<Box<dyn DiskRepWriter>> {
        Some(Box::new(BundleWriter {
            signature_dir: self.signature_dir(),
            components: BTreeMap::new(),
        }))
    }
}

fn slot_file_name(slot: CodeSigningSlot) -> String {
    match slot {
        CodeSigningSlot::CodeDirectory => "CodeDirectory".to_string(),
        CodeSigningSlot::RequirementSet => "CodeRequirements".to_string(),
        CodeSigningSlot::ResourceDir => "CodeResources".to_string(),
        CodeSigningSlot::Signature => "CodeSignature".to_string(),
        CodeSigningSlot::Entitlements => "CodeEntitlements".to_string(),
        _ => format!("Slot-{:x}", u32::from(slot)),
    }
}

/// Writes signature components as files under `_CodeSignature/`.
///
/// Components are staged in memory and only hit the filesystem on
/// [DiskRepWriter::flush].
pub struct BundleWriter {
    signature_dir: PathBuf,
    components: BTreeMap<CodeSigningSlot, Vec<u8>>,
}

impl DiskRepWriter for BundleWriter {
    fn component(&mut self, slot: CodeSigningSlot, data: &[u8]) -> Result<(), CodeIdentityError> {
        self.components.insert(slot, data.to_vec());
        Ok(())
    }

    fn attributes(&self) -> WriterAttributes {
        WriterAttributes::empty()
    }

    fn remove(&mut self) -> Result<(), CodeIdentityError> {
        if self.signature_dir.is_dir() {
            std::fs::remove_dir_all(&self.signature_dir)?;
        }

        Ok(())
    }

    fn flush(&mut self) -> Result<(), CodeIdentityError> {
        if self.components.is_empty() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.signature_dir)?;

        for (slot, data) in &self.components {
            let path = self.signature_dir.join(slot_file_name(*slot));
            std::fs::write(&path, data)?;
        }

        info!(
            "wrote {} signature components to {}",
            self.components.len(),
            self.signature_dir.display()
        );

        self.components.clear();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{disk_rep::SEGMENTED_PAGE_SIZE, macho::fixtures::*},
        goblin::mach::constants::cputype::CPU_TYPE_ARM64,
    };

    fn make_bundle(dir: &Path, identifier: Option<&str>) -> PathBuf {
        let bundle = dir.join("Widget.app");
        std::fs::create_dir_all(bundle.join("Contents/MacOS")).unwrap();
        std::fs::create_dir_all(bundle.join("Contents/Resources")).unwrap();

        let mut info = plist::Dictionary::new();
        info.insert(
            "CFBundleExecutable".to_string(),
            plist::Value::String("widget".to_string()),
        );
        if let Some(ident) = identifier {
            info.insert(
                "CFBundleIdentifier".to_string(),
                plist::Value::String(ident.to_string()),
            );
        }
        plist::Value::Dictionary(info)
            .to_file_xml(bundle.join("Contents/Info.plist"))
            .unwrap();

        std::fs::write(
            bundle.join("Contents/MacOS/widget"),
            thin_macho(CPU_TYPE_ARM64),
        )
        .unwrap();

        bundle
    }

    #[test]
    fn bundle_detection() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = make_bundle(dir.path(), None);

        assert!(BundleRep::path_is_bundle(&bundle));
        assert!(!BundleRep::path_is_bundle(dir.path()));
    }

    #[test]
    fn info_component_is_the_bundles_own() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = make_bundle(dir.path(), None);
        let rep = BundleRep::from_path(&bundle).unwrap();

        let info = rep.component(CodeSigningSlot::Info).unwrap().unwrap();
        assert_eq!(
            info,
            std::fs::read(bundle.join("Contents/Info.plist")).unwrap()
        );

        // No CodeResources present yet.
        assert!(rep.component(CodeSigningSlot::ResourceDir).unwrap().is_none());

        // Executable-borne slots delegate.
        assert!(rep.component(CodeSigningSlot::CodeDirectory).unwrap().is_none());
    }

    #[test]
    fn identifier_prefers_info_plist() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = make_bundle(dir.path(), Some("com.example.widget"));
        let rep = BundleRep::from_path(&bundle).unwrap();

        assert_eq!(rep.recommended_identifier().unwrap(), "com.example.widget");
    }

    #[test]
    fn identifier_falls_back_to_executable() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = make_bundle(dir.path(), None);
        let rep = BundleRep::from_path(&bundle).unwrap();

        assert_eq!(rep.recommended_identifier().unwrap(), "widget");
    }

    #[test]
    fn geometry_delegates_to_executable() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = make_bundle(dir.path(), None);
        let rep = BundleRep::from_path(&bundle).unwrap();

        assert_eq!(rep.page_size(), SEGMENTED_PAGE_SIZE);
        assert_eq!(rep.signing_base(), 0);
        assert_eq!(rep.signing_limit().unwrap(), 1024);
        assert!(rep.main_executable_is_macho().unwrap());
        assert_eq!(rep.canonical_path(), bundle);
        assert!(rep.format().starts_with("bundle with Mach-O"));
    }

    #[test]
    fn missing_executable_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("Broken.app");
        std::fs::create_dir_all(bundle.join("Contents")).unwrap();

        let mut info = plist::Dictionary::new();
        info.insert(
            "CFBundleExecutable".to_string(),
            plist::Value::String("ghost".to_string()),
        );
        plist::Value::Dictionary(info)
            .to_file_xml(bundle.join("Contents/Info.plist"))
            .unwrap();

        assert!(matches!(
            BundleRep::from_path(&bundle),
            Err(CodeIdentityError::BundleNoMainExecutable(_))
        ));
    }

    #[test]
    fn writer_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = make_bundle(dir.path(), None);
        let rep = BundleRep::from_path(&bundle).unwrap();

        let mut writer = rep.writer().unwrap();
        writer
            .component(CodeSigningSlot::ResourceDir, b"sealed resources")
            .unwrap();
        writer.component(CodeSigningSlot::CodeDirectory, b"cd").unwrap();
        writer
            .component(CodeSigningSlot::RequirementSet, b"requirements")
            .unwrap();

        // Nothing visible before flush.
        assert!(rep.component(CodeSigningSlot::ResourceDir).unwrap().is_none());
        assert!(rep.component(CodeSigningSlot::CodeDirectory).unwrap().is_none());

        writer.flush().unwrap();

        // Every written component reads back through the bundle.
        assert_eq!(
            rep.component(CodeSigningSlot::ResourceDir).unwrap().unwrap(),
            b"sealed resources"
        );
        assert_eq!(
            rep.component(CodeSigningSlot::CodeDirectory).unwrap().unwrap(),
            b"cd"
        );
        assert_eq!(
            rep.component(CodeSigningSlot::RequirementSet).unwrap().unwrap(),
            b"requirements"
        );

        writer.remove().unwrap();
        assert!(rep.component(CodeSigningSlot::ResourceDir).unwrap().is_none());
        assert!(rep.component(CodeSigningSlot::CodeDirectory).unwrap().is_none());
    }

    #[test]
    fn resource_adjustment_excludes_signature_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = make_bundle(dir.path(), None);
        let rep = BundleRep::from_path(&bundle).unwrap();

        assert!(rep.default_resource_rules().is_some());

        let mut builder = ResourceBuilder::new();
        rep.adjust_resources(&mut builder);

        assert!(builder
            .exclusions()
            .iter()
            .any(|p| p.contains("_CodeSignature")));
        assert!(builder.exclusions().iter().any(|p| p.contains("MacOS/widget")));
    }
}
