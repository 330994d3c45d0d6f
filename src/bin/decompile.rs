//! CLI entry point: `decompile <source-path> <destination-path>`.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

#[derive(Parser)]
#[command(about = "Decompile a LuaJIT bytecode dump into readable Lua source")]
struct Cli {
    /// Path to the compiled `.lua`/`.luac` bytecode dump to decompile.
    source: PathBuf,

    /// Path to write the recovered Lua source to.
    destination: PathBuf,

    /// Write an instruction-level debug dump instead of Lua source.
    #[arg(long)]
    dump_ir: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let bytes = fs::read(&cli.source).with_context(|| format!("reading {}", cli.source.display()))?;

    let output = if cli.dump_ir {
        ljtool::dump_ir(&bytes).with_context(|| format!("dumping {}", cli.source.display()))?
    } else {
        ljtool::decompile(&bytes).with_context(|| format!("decompiling {}", cli.source.display()))?
    };

    fs::write(&cli.destination, output).with_context(|| format!("writing {}", cli.destination.display()))?;
    Ok(())
}
