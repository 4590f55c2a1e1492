use clap::Parser;
use syncerd::cli::{Cli, Runner};
use syncerd::logging;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.quiet);

    let runner = Runner::new(cli);
    if let Err(e) = runner.run().await {
        runner.logger().error(&e.to_string());
        std::process::exit(1);
    }
}
