use clap::Parser;
use faqbot::cli::Cli;

fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (ignore errors if missing)
    dotenvy::dotenv().ok();

    faqbot::logging::init_from_env()?;

    let cli = Cli::parse();
    cli.run()
}
