use super::{container_exit_status, json_pretty, EXIT_SUCCESS};
use podroid_core::Engine;
use podroid_store::ContainerStatus;

pub fn run(engine: &Engine, container: &str, json: bool) -> Result<u8, String> {
    let restarted = engine.restart(container).map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&restarted)?);
    } else if restarted.status == ContainerStatus::Running {
        println!("restarted container {}", restarted.display_name());
    }
    if restarted.status == ContainerStatus::Running {
        Ok(EXIT_SUCCESS)
    } else {
        Ok(container_exit_status(&restarted))
    }
}
