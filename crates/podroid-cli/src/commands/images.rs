use super::{json_pretty, EXIT_SUCCESS};
use podroid_core::Engine;

pub fn run(engine: &Engine, json: bool) -> Result<u8, String> {
    let images = engine.images().map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&images)?);
    } else if images.is_empty() {
        println!("no images found");
    } else {
        println!("{:<40} {:<10} {:<18} CREATED", "IMAGE", "SOURCE", "ID");
        for image in &images {
            println!(
                "{:<40} {:<10} {:<18} {}",
                image.image_url,
                image.source,
                image.short_hash(),
                image.created_time_str
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
