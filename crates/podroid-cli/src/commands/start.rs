use super::{container_exit_status, json_pretty, EXIT_SUCCESS};
use podroid_core::Engine;
use podroid_store::ContainerStatus;

pub fn run(engine: &Engine, container: &str, json: bool) -> Result<u8, String> {
    let started = engine.start(container).map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&started)?);
    } else if started.status == ContainerStatus::Running {
        println!("started container {}", started.display_name());
    }
    if started.status == ContainerStatus::Running {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(container_exit_status(&started))
    }
}
