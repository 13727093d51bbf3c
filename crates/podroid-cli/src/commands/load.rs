use super::{json_pretty, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use podroid_core::Engine;
use std::path::Path;

pub fn run(engine: &Engine, archive: &Path, json: bool) -> Result<u8, String> {
    let pb = spinner(&format!("loading {}…", archive.display()));
    let entry = engine.load(archive).map_err(|e| {
        spin_fail(&pb, "load failed");
        e.to_string()
    })?;
    spin_ok(&pb, &format!("loaded {}", entry.image_url));

    if json {
        println!("{}", json_pretty(&entry)?);
    } else {
        println!("Loaded image: {}", entry.image_url);
    }
    Ok(EXIT_SUCCESS)
}
