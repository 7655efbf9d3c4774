use clap::Parser;
use registry_dumper::cli::{Args, Runner};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let runner = Runner::new(args);

    match runner.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            runner.output().error(&err.to_string());
            ExitCode::from(err.exit_code())
        }
    }
}
