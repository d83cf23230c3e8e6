use clap::Parser;

mod cli;
pub mod exit_codes;
mod logging;

use cli::args::Cli;
use cli::commands::dispatch;

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();
    let run_id = intercept_core::RunId::new();
    if let Err(e) = logging::init(&cli.logging(), &run_id) {
        eprintln!("fatal: {e:?}");
        std::process::exit(exit_codes::CONFIG_ERROR);
    }
    let code = match dispatch(cli, run_id).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("fatal: {e:?}");
            exit_codes::for_error(&e)
        }
    };
    std::process::exit(code);
}
