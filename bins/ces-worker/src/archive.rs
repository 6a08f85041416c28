//! Packaging of a single source file into a tar archive for the engine.

use std::fs::File;
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Write `source` into a fresh archive at `archive`, stored under `entry_name`.
///
/// Blocking; call through `spawn_blocking`.
pub fn pack_single_file(source: &Path, entry_name: &str, archive: &Path) -> io::Result<()> {
    let mut input = File::open(source)?;
    let size = input.metadata()?.len();
    let mtime = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);

    let mut header = tar::Header::new_gnu();
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(mtime);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();

    let mut builder = tar::Builder::new(File::create(archive)?);
    builder.append_data(&mut header, entry_name, &mut input)?;
    builder.into_inner()?.sync_all()
}
