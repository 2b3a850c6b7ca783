//! Stable machine fingerprint.
//!
//! All store queries are scoped by this id so a storage path shared over NFS
//! cannot surface another machine's jobs. It is intentionally neither a
//! secret nor a UUID: the same machine always derives the same id.

use std::ffi::CStr;

use sha2::{Digest, Sha256};

/// First 12 hex chars of SHA-256 over `node;system;release;version;machine;processor`.
pub fn host_id() -> String {
    let facts = uname_facts().join(";");
    let digest = Sha256::digest(facts.as_bytes());
    let mut id = String::with_capacity(12);
    for byte in &digest[..6] {
        id.push_str(&format!("{byte:02x}"));
    }
    id
}

/// The uname(2) facts in the order they are hashed. The kernel has no
/// separate "processor" notion, so the compile-time architecture stands in.
fn uname_facts() -> [String; 6] {
    // SAFETY: uname(2) fills the zeroed buffer; on failure the fields stay
    // zeroed and decode to empty strings, which still hashes deterministically.
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    unsafe {
        libc::uname(&mut uts);
    }

    [
        field_to_string(&uts.nodename),
        field_to_string(&uts.sysname),
        field_to_string(&uts.release),
        field_to_string(&uts.version),
        field_to_string(&uts.machine),
        std::env::consts::ARCH.to_string(),
    ]
}

fn field_to_string(field: &[libc::c_char]) -> String {
    // SAFETY: utsname fields are NUL-terminated fixed-size arrays.
    unsafe { CStr::from_ptr(field.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}
