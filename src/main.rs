use anyhow::{anyhow, Result};

use busgate::cli::{actions, parse_args};

fn main() -> Result<()> {
    env_logger::init();
    let matches = parse_args();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("Failed to create tokio runtime: {}", e))?;

    match matches.subcommand() {
        Some(("run", sub)) => runtime.block_on(actions::run(sub)),
        Some(("exec", sub)) => {
            if !runtime.block_on(actions::exec(sub))? {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(("check-config", sub)) => actions::check_config(sub),
        _ => Err(anyhow!("unknown subcommand")),
    }
}
