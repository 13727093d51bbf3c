use super::create::create_container;
use super::{container_exit_status, json_pretty, EXIT_SUCCESS};
use podroid_core::Engine;
use podroid_store::{ContainerStatus, RunArgs};

/// Create and start. Detached: prints the id once the process is confirmed
/// alive. Foreground: exits with the container's exit code.
pub fn run(
    engine: &Engine,
    image: &str,
    name: Option<&str>,
    run_args: RunArgs,
    json: bool,
) -> Result<u8, String> {
    let detach = run_args.detach;
    let created = create_container(engine, image, name, run_args)?;
    let container = engine
        .start(created.id.as_str())
        .map_err(|e| e.to_string())?;

    if json {
        println!("{}", json_pretty(&container)?);
    } else if detach {
        if container.status == ContainerStatus::Running {
            println!("{}", container.id);
        } else {
            eprintln!(
                "container {} exited during startup, see `podroid logs {}`",
                container.display_name(),
                container.id.short()
            );
        }
    }

    if detach {
        if container.status == ContainerStatus::Running {
            Ok(EXIT_SUCCESS)
        } else {
            Ok(container_exit_status(&container).max(1))
        }
    } else {
        Ok(container_exit_status(&container))
    }
}
