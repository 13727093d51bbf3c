use super::{json_pretty, EXIT_SUCCESS};
use podroid_core::Engine;

pub fn run(engine: &Engine, image: &str, json: bool) -> Result<u8, String> {
    let removed = engine.rmi(image).map_err(|e| e.to_string())?;
    if json {
        let payload = serde_json::json!({
            "image": image,
            "entries_removed": removed,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("removed image {image}");
    }
    Ok(EXIT_SUCCESS)
}
