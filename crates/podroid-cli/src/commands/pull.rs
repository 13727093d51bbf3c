use super::{json_pretty, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use podroid_core::Engine;

pub fn run(engine: &Engine, image: &str, json: bool) -> Result<u8, String> {
    let pb = spinner(&format!("pulling {image}…"));
    let entry = engine
        .pull(image, &|msg| pb.set_message(msg.to_owned()))
        .map_err(|e| {
            spin_fail(&pb, "pull failed");
            e.to_string()
        })?;
    spin_ok(&pb, &format!("pulled {image}"));

    if json {
        println!("{}", json_pretty(&entry)?);
    } else {
        println!("{} {}", entry.image_url, entry.short_hash());
    }
    Ok(EXIT_SUCCESS)
}
