use std::io::Write;
use std::path::Path;

use dbvault_core::config;

/// Write the starter config to `dest`, never replacing an existing file.
pub(crate) fn run_config_generate(dest: &str) -> Result<(), Box<dyn std::error::Error>> {
    let path = Path::new(dest);
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut file = match std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(format!("file already exists: {}", path.display()).into());
        }
        Err(e) => return Err(e.into()),
    };
    file.write_all(config::minimal_config_template().as_bytes())?;

    println!("Config written to: {}", path.display());
    println!("Next: add your databases, then run `dbvault keygen` for an encryption key.");
    Ok(())
}
