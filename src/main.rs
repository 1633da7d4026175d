use clap::Parser;
use log::{debug, warn};
use snafu::ErrorCompat;

mod args;
mod deck;

#[tokio::main]
async fn main() {
    let args = args::Args::parse();

    if args.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::init();
    }
    debug!("args: {:?}", args);

    let res = deck::run_deck(
        &args.config,
        args.votes.as_deref(),
        &args.cast,
        args.category.as_deref(),
        args.out.as_deref(),
    )
    .await;

    if let Err(e) = res {
        warn!("Error occured {:?}", e);
        eprintln!("An error occured: {}", e);
        if let Some(source) = std::error::Error::source(&e) {
            eprintln!("caused by: {}", source);
        }
        if let Some(bt) = ErrorCompat::backtrace(&e) {
            eprintln!("trace: {}", bt);
        }
        std::process::exit(1);
    }
}
