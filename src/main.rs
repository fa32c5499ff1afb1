use std::io::IsTerminal;

use tracing::error;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use keelscan::cli::commands::Command;
use keelscan::cli::{parse_args, CommandLineArgs};
use keelscan::errors::Result;

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        LevelFilter::ERROR
    } else {
        match verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        }
    };
    let filter = Targets::new()
        .with_default(level)
        .with_target("hyper", LevelFilter::WARN)
        .with_target("reqwest", LevelFilter::WARN);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal()),
        )
        .with(filter)
        .init();
}

async fn run(args: &CommandLineArgs) -> Result<()> {
    match &args.command {
        Command::Image(command) => keelscan::cli::commands::image::run(&args.global, command).await,
        Command::K8sObject(command) => {
            keelscan::cli::commands::k8s_object::run(&args.global, command).await
        }
    }
}

fn main() {
    let args = parse_args();
    init_logging(args.global.verbose, args.global.quiet);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to start async runtime");
            std::process::exit(1);
        }
    };

    if let Err(err) = runtime.block_on(run(&args)) {
        error!("{err}");
        std::process::exit(err.exit_code());
    }
}
