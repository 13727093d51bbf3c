use super::{json_pretty, status_label, EXIT_SUCCESS};
use podroid_core::Engine;

pub fn run(engine: &Engine, all: bool, json: bool) -> Result<u8, String> {
    let containers = engine.ps(all).map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&containers)?);
    } else if containers.is_empty() {
        println!("no containers found");
    } else {
        println!(
            "{:<14} {:<16} {:<28} {:<12} CREATED",
            "CONTAINER_ID", "NAME", "IMAGE", "STATUS"
        );
        for c in &containers {
            println!(
                "{:<14} {:<16} {:<28} {:<12} {}",
                c.id.short(),
                c.name.as_deref().unwrap_or(""),
                c.image,
                status_label(c),
                c.created_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
