use clap::Parser;
use tracing_subscriber::EnvFilter;
use xp_app::{
    app::{run, AppConfig},
    cli::Cli,
};

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = AppConfig::from_env().and_then(|mut config| {
        config.apply_cli(&cli);
        let stdout = std::io::stdout();
        run(&config, &cli.command, cli.json, &mut stdout.lock())
    });
    if let Err(err) = result {
        eprintln!("xptrack: {err:#}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
