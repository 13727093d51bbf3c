use super::{json_pretty, EXIT_SUCCESS};
use podroid_core::Engine;

pub fn run(engine: &Engine, container: &str, force: bool, json: bool) -> Result<u8, String> {
    let removed = engine.rm(container, force).map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&removed)?);
    } else {
        println!("removed container {}", removed.display_name());
    }
    Ok(EXIT_SUCCESS)
}
