mod cli;
mod inpainting;

fn main() {
    if let Err(err) = run() {
        eprintln!("Failed to run the graph: {err:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let config = cli::parse_config()?;
    inpainting::run(config)
}
