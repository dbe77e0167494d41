//! Queen front end: integrate sin(x) across a set of drones

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::error;

use hive_pool::integral::{self, IntegralTask};
use hive_pool::proto::{encode_all, Record};
use hive_pool::queen::{start_job, QueenConfig};

#[derive(Parser, Debug)]
#[command(name = "hive-queen", version, about = "Distribute a sin(x) integral over N drones")]
struct Args {
    /// Address to listen on
    address: String,

    /// Port to listen on
    port: String,

    /// Deadline for all results, in seconds
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    max_time: u64,

    /// Number of drones to wait for
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    num_nodes: u64,

    #[arg(long, default_value_t = integral::DEFAULT_LEFT, allow_negative_numbers = true)]
    left: f64,

    #[arg(long, default_value_t = integral::DEFAULT_RIGHT, allow_negative_numbers = true)]
    right: f64,

    #[arg(long, default_value_t = integral::DEFAULT_PRECISION)]
    precision: f64,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(&args) {
        Ok(total) => {
            println!("Result: {}", total);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> hive_pool::Result<f64> {
    let nodes = usize::try_from(args.num_nodes).unwrap_or(usize::MAX);
    let config = QueenConfig::resolve(
        &args.address,
        &args.port,
        Duration::from_secs(args.max_time),
        nodes,
    )?;

    let tasks = integral::plan(args.left, args.right, args.precision, nodes);
    let output = start_job(config, IntegralTask::SIZE, &encode_all(&tasks))?;
    Ok(output.decode::<f64>()?.iter().sum())
}
