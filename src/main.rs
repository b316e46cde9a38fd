use anyhow::Context;
use cmd_bridge::{Args, Config, Interpreter, Interrupt};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cmd_bridge=warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Args = argh::from_env();
    match run(args) {
        Ok(code) => ExitCode::from(exit_status_byte(code)),
        Err(e) => {
            eprintln!("cmd_bridge: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Narrows a child's code to a process status without turning failures into 0.
///
/// Negative codes (Windows NTSTATUS crashes) become 1, large ones 255.
fn exit_status_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(if code < 0 { 1 } else { 255 })
}

fn run(args: Args) -> anyhow::Result<i32> {
    let config = Config::from_args(&args)?;
    let interrupt = Interrupt::install().context("can't install the Ctrl+C handler")?;
    let mut sh = Interpreter::new(config, interrupt)?;
    tracing::info!(
        entries = sh.table().len(),
        elevated = sh.env().elevated,
        "session starting"
    );

    if let Some(line) = &args.command {
        return Ok(sh.run_line(line));
    }

    sh.repl().context("line editor failed")?;
    Ok(0)
}
