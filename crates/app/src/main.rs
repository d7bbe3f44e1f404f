mod cli;
mod html;
mod scanner;

use clap::Parser;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    scanner::init_tracing()?;
    cli::handle_commands(cli)
}
