use clap::Parser;
use tracing::error;

fn main() {
    let cli = skywatchctl::Cli::parse();
    skywatchctl::init_tracing(cli.verbose);
    if let Err(err) = skywatchctl::run(cli) {
        error!(%err, "run aborted");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
