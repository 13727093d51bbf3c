use super::{json_pretty, spin_fail, spin_ok, spinner, EXIT_SUCCESS};
use podroid_core::Engine;
use podroid_store::{Container, RunArgs};

/// Create the container behind a spinner. Shared with `run`.
pub fn create_container(
    engine: &Engine,
    image: &str,
    name: Option<&str>,
    run_args: RunArgs,
) -> Result<Container, String> {
    let pb = spinner(&format!("creating container from {image}…"));
    let container = engine
        .create(image, name, run_args, &|msg| pb.set_message(msg.to_owned()))
        .map_err(|e| {
            spin_fail(&pb, "create failed");
            e.to_string()
        })?;
    spin_ok(
        &pb,
        &format!("created container {}", container.display_name()),
    );
    Ok(container)
}

pub fn run(
    engine: &Engine,
    image: &str,
    name: Option<&str>,
    run_args: RunArgs,
    json: bool,
) -> Result<u8, String> {
    let container = create_container(engine, image, name, run_args)?;
    if json {
        println!("{}", json_pretty(&container)?);
    } else {
        println!("{}", container.id);
    }
    Ok(EXIT_SUCCESS)
}
