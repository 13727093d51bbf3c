use super::EXIT_SUCCESS;
use podroid_core::Engine;

pub fn run(engine: &Engine, container: &str, tail: Option<usize>) -> Result<u8, String> {
    let text = engine.logs(container).map_err(|e| e.to_string())?;
    match tail {
        Some(n) => {
            let lines: Vec<&str> = text.lines().collect();
            for line in &lines[lines.len().saturating_sub(n)..] {
                println!("{line}");
            }
        }
        None => print!("{text}"),
    }
    Ok(EXIT_SUCCESS)
}
