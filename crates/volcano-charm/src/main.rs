use clap::Parser;
use snafu::{ResultExt, Snafu};
use volcano_charm::{cli::Opts, logging};

const APP_NAME: &str = "volcano-charm";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::Error },

    #[snafu(display("failed to run command"))]
    Run { source: volcano_charm::cli::Error },
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let opts = Opts::parse();
    logging::initialize_logging("VOLCANO_CHARM_LOG", APP_NAME).context(InitializeLoggingSnafu)?;

    opts.command.run().await.context(RunSnafu)
}
