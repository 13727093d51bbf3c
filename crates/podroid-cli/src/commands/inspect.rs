use super::{json_pretty, status_label, EXIT_SUCCESS};
use podroid_core::Engine;

pub fn run(engine: &Engine, container: &str, json: bool) -> Result<u8, String> {
    let c = engine.inspect(container).map_err(|e| e.to_string())?;
    if json {
        println!("{}", json_pretty(&c)?);
        return Ok(EXIT_SUCCESS);
    }

    let args = &c.run_args;
    println!("id:          {}", c.id);
    println!("name:        {}", c.name.as_deref().unwrap_or("(none)"));
    println!("image:       {}", c.image);
    println!("status:      {}", status_label(&c));
    if let Some(pid) = c.pid {
        println!("pid:         {pid}");
    }
    if args.command.is_empty() {
        println!("command:     (image default)");
    } else {
        println!("command:     {}", args.command.join(" "));
    }
    println!("fake_root:   {}", args.fake_root);
    println!("detach:      {}", args.detach);
    for bind in &args.binds {
        println!("bind:        {bind}");
    }
    for var in &args.env {
        println!("env:         {var}");
    }
    println!("dir:         {}", c.container_dir.display());
    println!("created_at:  {}", c.created_at.to_rfc3339());
    if let Some(t) = c.started_at {
        println!("started_at:  {}", t.to_rfc3339());
    }
    if let Some(t) = c.finished_at {
        println!("finished_at: {}", t.to_rfc3339());
    }
    Ok(EXIT_SUCCESS)
}
