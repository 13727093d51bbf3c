mod commands;

use clap::{Args, Parser, Subcommand};
use commands::{EXIT_FAILURE, EXIT_IMAGE_ERROR, EXIT_STORE_ERROR};
use podroid_core::{install_signal_handler, Engine};
use podroid_store::RunArgs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "podroid",
    version,
    about = "Pull OCI images and run them as proot containers, no root required"
)]
struct Cli {
    /// Path to the podroid store directory.
    #[arg(long, env = "PODROID_STORE", default_value = "~/.local/share/podroid")]
    store: String,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct ContainerArgs {
    /// Image reference (e.g. "alpine:3.19") or the name of a loaded archive.
    image: String,
    /// Name for the container.
    #[arg(long)]
    name: Option<String>,
    /// Set an environment variable (KEY=VALUE, or KEY to copy it from the host).
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,
    /// Bind a host path into the container (HOST:CONTAINER).
    #[arg(short, long = "bind", value_name = "HOST:CONTAINER")]
    bind: Vec<String>,
    /// Working directory inside the container.
    #[arg(short, long)]
    workdir: Option<String>,
    /// Run as the invoking user instead of emulated root.
    #[arg(long, default_value_t = false)]
    no_fake_root: bool,
    /// Command to run instead of the image default.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl ContainerArgs {
    fn into_run_args(
        self,
        detach: bool,
        fake_root_default: bool,
    ) -> (String, Option<String>, RunArgs) {
        let run_args = RunArgs {
            command: self.command,
            env: self.env,
            binds: self.bind,
            workdir: self.workdir,
            detach,
            fake_root: fake_root_default && !self.no_fake_root,
        };
        (self.image, self.name, run_args)
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull an image from a registry into the local cache.
    Pull {
        /// Image reference (e.g. "alpine", "ghcr.io/org/app:1.2").
        image: String,
    },
    /// Import an image archive produced by `docker save`.
    Load {
        /// Path to the tar archive.
        archive: PathBuf,
    },
    /// List cached images.
    Images,
    /// Remove a cached image.
    Rmi {
        /// Image name as shown by `podroid images`.
        image: String,
    },
    /// Create a container without starting it.
    Create {
        #[command(flatten)]
        args: ContainerArgs,
    },
    /// Create and start a container (use -d to run it in the background).
    Run {
        /// Run in the background, logging to the container log.
        #[arg(short, long, default_value_t = false)]
        detach: bool,
        #[command(flatten)]
        args: ContainerArgs,
    },
    /// Start a created, stopped, or exited container.
    Start {
        /// Container ID, unique ID prefix, or name.
        container: String,
    },
    /// Stop a running container.
    Stop {
        /// Container ID, unique ID prefix, or name.
        container: String,
    },
    /// Stop a container if it is running, then start it again.
    Restart {
        /// Container ID, unique ID prefix, or name.
        container: String,
    },
    /// Remove a container and its files.
    Rm {
        /// Container ID, unique ID prefix, or name.
        container: String,
        /// Stop the container first if it is running.
        #[arg(short, long, default_value_t = false)]
        force: bool,
    },
    /// List containers.
    Ps {
        /// Include containers that are not running.
        #[arg(short, long, default_value_t = false)]
        all: bool,
    },
    /// Show the output of a detached container.
    Logs {
        /// Container ID, unique ID prefix, or name.
        container: String,
        /// Only show the last N lines.
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Show a container's record.
    Inspect {
        /// Container ID, unique ID prefix, or name.
        container: String,
    },
    /// Run diagnostic checks on the host and store.
    Doctor,
}

#[allow(clippy::too_many_lines)]
fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("PODROID_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let store_path = expand_tilde(&cli.store);
    let engine = match Engine::new(&store_path) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    let json_output = cli.json;

    let needs_runtime = matches!(
        cli.command,
        Commands::Run { .. } | Commands::Start { .. } | Commands::Restart { .. }
    );
    if needs_runtime {
        if let Err(e) = engine.runtime().check_available() {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    }

    let fake_root = engine.settings().runtime.fake_root;
    let result = match cli.command {
        Commands::Pull { image } => commands::pull::run(&engine, &image, json_output),
        Commands::Load { archive } => commands::load::run(&engine, &archive, json_output),
        Commands::Images => commands::images::run(&engine, json_output),
        Commands::Rmi { image } => commands::rmi::run(&engine, &image, json_output),
        Commands::Create { args } => {
            let (image, name, run_args) = args.into_run_args(false, fake_root);
            commands::create::run(&engine, &image, name.as_deref(), run_args, json_output)
        }
        Commands::Run { detach, args } => {
            let (image, name, run_args) = args.into_run_args(detach, fake_root);
            commands::run::run(&engine, &image, name.as_deref(), run_args, json_output)
        }
        Commands::Start { container } => commands::start::run(&engine, &container, json_output),
        Commands::Stop { container } => commands::stop::run(&engine, &container, json_output),
        Commands::Restart { container } => {
            commands::restart::run(&engine, &container, json_output)
        }
        Commands::Rm { container, force } => {
            commands::rm::run(&engine, &container, force, json_output)
        }
        Commands::Ps { all } => commands::ps::run(&engine, all, json_output),
        Commands::Logs { container, tail } => commands::logs::run(&engine, &container, tail),
        Commands::Inspect { container } => {
            commands::inspect::run(&engine, &container, json_output)
        }
        Commands::Doctor => commands::doctor::run(&engine, json_output),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("image error:") {
                EXIT_IMAGE_ERROR
            } else if msg.starts_with("store error:") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
