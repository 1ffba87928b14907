use anyhow::{Context, Result};
use std::path::Path;

/// Store directory must exist (or be creatable) and accept writes.
pub fn check_store_dir(dir: &str) -> Result<()> {
    let p = Path::new(dir);
    if p.exists() {
        anyhow::ensure!(p.is_dir(), "storage.dir is not a dir: {}", dir);
    }
    std::fs::create_dir_all(p).with_context(|| format!("create storage.dir {}", dir))?;
    let probe = p.join(".doctor-probe");
    std::fs::write(&probe, b"ok").with_context(|| format!("storage.dir not writable: {}", dir))?;
    std::fs::remove_file(&probe).ok();
    Ok(())
}
