// File helpers

use std::path::Path;

/// Read a whole file into memory.
///
/// Any I/O failure (missing file, permission denied, ...) is logged and
/// reported as an empty buffer. Callers that cannot work with zero bytes
/// have to check for that themselves.
pub fn read_file<P: AsRef<Path>>(path: P) -> Vec<u8> {
    let path = path.as_ref();
    match std::fs::read(path) {
        Ok(bytes) => {
            log::debug!("Read {} bytes from {:?}", bytes.len(), path);
            bytes
        }
        Err(e) => {
            log::warn!("Could not read {:?}: {}", path, e);
            Vec::new()
        }
    }
}
