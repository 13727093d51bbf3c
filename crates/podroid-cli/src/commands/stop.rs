use super::{json_pretty, EXIT_SUCCESS};
use podroid_core::Engine;

pub fn run(engine: &Engine, container: &str, json: bool) -> Result<u8, String> {
    let stopped = engine.stop(container).map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&stopped)?);
    } else {
        println!("stopped container {}", stopped.display_name());
    }
    Ok(EXIT_SUCCESS)
}
