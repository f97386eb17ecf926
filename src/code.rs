// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Running code and the host/guest hierarchy.
//!
//! A [Code] is code in execution: it sits in a hosting chain rooted at the
//! system, may host guests of its own, and lazily resolves the
//! [StaticCode] it was launched from. How guests are enumerated and how a
//! running instance maps back to disk is supplied by a [CodeHosting]
//! implementation; the object model itself is host-agnostic.

use {
    crate::{
        disk_rep::Context,
        error::CodeIdentityError,
        static_code::{StaticCode, ValidationFlags},
    },
    bitflags::bitflags,
    log::debug,
    once_cell::sync::OnceCell,
    std::{
        path::PathBuf,
        sync::{Arc, Weak},
    },
};

/// Guest reference value meaning "the host itself".
pub const NO_GUEST: u32 = 0;

/// Attributes used to select a guest within a host.
///
/// All populated fields must match. An empty set matches any guest, which
/// hosts with more than one guest must reject as ambiguous.
#[derive(Clone, Debug, Default)]
pub struct GuestAttributes {
    /// Host-assigned guest handle.
    pub guest_ref: Option<u32>,
    /// Process id, for process-based hosts.
    pub pid: Option<u32>,
    /// Canonical on-disk path of the guest.
    pub canonical_path: Option<PathBuf>,
    /// Signing identifier of the guest.
    pub identifier: Option<String>,
}

impl GuestAttributes {
    pub fn with_identifier(identifier: impl ToString) -> Self {
        Self {
            identifier: Some(identifier.to_string()),
            ..Default::default()
        }
    }

    pub fn with_guest_ref(guest_ref: u32) -> Self {
        Self {
            guest_ref: Some(guest_ref),
            ..Default::default()
        }
    }
}

bitflags! {
    /// Dynamic status of running code, as maintained by its host.
    pub struct CodeStatus: u32 {
        /// The code is considered dynamically valid.
        const VALID = 0x1;
        /// Invalid pages cause the code to be hardened against tampering.
        const HARD = 0x100;
        /// Invalidation kills the code outright.
        const KILL = 0x200;
    }
}

/// Supplies the host-specific behavior of a [Code].
///
/// Only static code resolution is mandatory; the guest hooks default to
/// "hosts nothing".
pub trait CodeHosting: Send + Sync {
    /// Map this running code to its static code on disk.
    fn resolve_static_code(&self) -> Result<StaticCode, CodeIdentityError>;

    /// Find a direct guest matching the attributes.
    ///
    /// `Ok(None)` means no guest matches; hosts with several matching
    /// guests return [CodeIdentityError::MultipleGuests]. The default
    /// hosts nothing.
    fn locate_guest(
        &self,
        _attrs: &GuestAttributes,
    ) -> Result<Option<Arc<Code>>, CodeIdentityError> {
        Ok(None)
    }

    /// Map a guest to its static code as this host sees it.
    ///
    /// A host may identify a guest's on-disk form differently than the
    /// guest identifies itself. The default trusts the guest.
    fn map_guest_to_static(
        &self,
        guest: &Arc<Code>,
    ) -> Result<Arc<StaticCode>, CodeIdentityError> {
        guest.static_code()
    }

    /// Dynamic status of a guest, as this host sees it.
    fn guest_status(&self, _guest: &Code) -> Result<CodeStatus, CodeIdentityError> {
        Ok(CodeStatus::VALID)
    }
}

/// Code in execution.
pub struct Code {
    /// The immediate host, absent for the root of the hierarchy.
    host: Option<Weak<Code>>,
    hosting: Box<dyn CodeHosting>,
    /// Resolved lazily. A failed resolution leaves the cell empty so a
    /// later attempt can succeed; a success is frozen for the lifetime of
    /// the object.
    static_code: OnceCell<Arc<StaticCode>>,
}

impl Code {
    /// Create the root of a hosting hierarchy.
    pub fn new_root(hosting: Box<dyn CodeHosting>) -> Arc<Self> {
        Arc::new(Self {
            host: None,
            hosting,
            static_code: OnceCell::new(),
        })
    }

    /// Create a guest within the given host.
    pub fn new_guest(host: &Arc<Code>, hosting: Box<dyn CodeHosting>) -> Arc<Self> {
        Arc::new(Self {
            host: Some(Arc::downgrade(host)),
            hosting,
            static_code: OnceCell::new(),
        })
    }

    /// The immediate host, if it is still alive.
    pub fn host(&self) -> Option<Arc<Code>> {
        self.host.as_ref().and_then(Weak::upgrade)
    }

    pub fn is_root(&self) -> bool {
        self.host.is_none()
    }

    /// The static code this running code was launched from.
    pub fn static_code(&self) -> Result<Arc<StaticCode>, CodeIdentityError> {
        self.static_code
            .get_or_try_init(|| Ok(Arc::new(self.hosting.resolve_static_code()?)))
            .map(Arc::clone)
    }

    /// The signing identifier of this code.
    pub fn identifier(&self) -> Result<String, CodeIdentityError> {
        self.static_code()?.identifier()
    }

    /// Find a direct guest of this code.
    pub fn locate_guest(
        &self,
        attrs: &GuestAttributes,
    ) -> Result<Option<Arc<Code>>, CodeIdentityError> {
        self.hosting.locate_guest(attrs)
    }

    /// A guest's static code, as seen by this host.
    pub fn guest_static_code(
        &self,
        guest: &Arc<Code>,
    ) -> Result<Arc<StaticCode>, CodeIdentityError> {
        self.hosting.map_guest_to_static(guest)
    }

    /// Dynamic status as reported by this code's host.
    ///
    /// The root has no host to disagree with it and is always valid.
    pub fn status(&self) -> Result<CodeStatus, CodeIdentityError> {
        match self.host() {
            Some(host) => host.hosting.guest_status(self),
            None => Ok(CodeStatus::VALID),
        }
    }

    /// Resolve a guest anywhere below `root` by descending the hierarchy.
    ///
    /// At each level the current host is asked for a matching guest; the
    /// search follows matches downward and the deepest match wins. A root
    /// with no matching guest at all is [CodeIdentityError::NoSuchGuest].
    pub fn auto_locate_guest(
        root: &Arc<Code>,
        attrs: &GuestAttributes,
    ) -> Result<Arc<Code>, CodeIdentityError> {
        let mut found: Option<Arc<Code>> = None;
        let mut current = root.clone();

        loop {
            match current.locate_guest(attrs)? {
                Some(guest) => {
                    current = guest.clone();
                    found = Some(guest);
                }
                None => break,
            }
        }

        found.ok_or(CodeIdentityError::NoSuchGuest)
    }

    /// Validate this code dynamically: every host up the chain must be
    /// valid, this code's status must be valid, and its static code must
    /// pass validation.
    pub fn check_validity(&self, flags: ValidationFlags) -> Result<(), CodeIdentityError> {
        let status = self.status()?;
        if !status.contains(CodeStatus::VALID) {
            debug!("host reports code status {:?}", status);
            return Err(CodeIdentityError::GuestInvalid);
        }

        if let Some(host) = self.host() {
            host.check_validity(flags)?;
        }

        self.static_code()?.validate(flags)
    }
}

impl std::fmt::Debug for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Code")
            .field("is_root", &self.is_root())
            .field("static_code", &self.static_code.get())
            .finish()
    }
}

/// Hosting for code whose static code is a path on disk.
///
/// This is the degenerate hosting used when constructing a [Code] directly
/// from a file or bundle rather than from a live host.
pub struct DiskHosting {
    path: PathBuf,
    context: Context,
}

impl DiskHosting {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            context: Context::default(),
        }
    }

    pub fn with_context(path: impl Into<PathBuf>, context: Context) -> Self {
        Self {
            path: path.into(),
            context,
        }
    }
}

impl CodeHosting for DiskHosting {
    fn resolve_static_code(&self) -> Result<StaticCode, CodeIdentityError> {
        StaticCode::from_path_with_context(&self.path, &self.context).map_err(|err| match err {
            CodeIdentityError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                CodeIdentityError::StaticCodeNotFound(self.path.clone())
            }
            other => other,
        })
    }
}
