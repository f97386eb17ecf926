// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Code identity for Apple code signing.

This crate models *what signed code is* independent of any particular
on-disk format. Its two pillars are:

* **Disk representations** ([disk_rep::DiskRep]): uniform access to the
  named components of a code signature, whatever the storage format.
  Implementations cover thin and universal Mach-O binaries
  ([macho_rep::MachORep]), bundles ([bundle_rep::BundleRep]), and
  arbitrary files ([file_rep::FileRep]), plus a filtering decorator
  ([filter_rep::FilterRep]) used to overlay detached signatures.
  Callers resolve a path with [disk_rep::best_guess] and friends rather
  than naming formats.

* **The code object model**: [static_code::StaticCode] is code at rest,
  giving signature-level meaning (identifier, cdhash, validation) to a
  disk representation; [code::Code] is code in execution, living in a
  host/guest hierarchy and lazily resolving back to its static code.

Supporting modules handle the signature wire formats:
[embedded_signature] for superblob and slot primitives,
[code_directory] for the code directory structure, and [macho] for
locating signature data inside Mach-O binaries.

# Example

```no_run
use codesign_identity::{disk_rep::best_guess, static_code::StaticCode};

let rep = best_guess(std::path::Path::new("/Applications/Utility.app"))?;
println!("{}", rep.format());

let code = StaticCode::new(rep);
if let Some(cd) = code.code_directory()? {
    println!("signed as {}", cd.ident);
}
# Ok::<(), codesign_identity::CodeIdentityError>(())
```
*/

pub mod bundle_rep;
pub mod code;
pub mod code_directory;
pub mod disk_rep;
pub mod embedded_signature;
pub mod error;
pub mod file_rep;
pub mod filter_rep;
pub mod macho;
pub mod macho_rep;
pub mod resources;
pub mod static_code;

pub use error::CodeIdentityError;
