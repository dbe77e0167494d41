//! Drone front end: integrate the received slice of sin(x)

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use log::{error, info};

use hive_pool::drone::accumulator::summing;
use hive_pool::integral::{self, IntegralTask};
use hive_pool::proto::Record;
use hive_pool::{Drone, DroneConfig};

#[derive(Parser, Debug)]
#[command(name = "hive-drone", version, about = "Compute one share of a queen's job")]
struct Args {
    /// Queen address
    address: String,

    /// Queen port
    port: String,

    /// Number of cores to compute on
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    num_cores: u64,

    /// Seconds to wait for the queen's release after sending the result
    #[arg(long, default_value_t = 10)]
    max_time: u64,

    /// Delay between connection attempts, in milliseconds
    #[arg(long, default_value_t = 1000)]
    retry_ms: u64,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> hive_pool::Result<()> {
    let cores = usize::try_from(args.num_cores).unwrap_or(usize::MAX);
    let config = DroneConfig::resolve(&args.address, &args.port, cores, IntegralTask::SIZE)?
        .with_deadline(Duration::from_secs(args.max_time))
        .with_retry_interval(Duration::from_millis(args.retry_ms));

    let mut drone = Drone::connect(config)?;
    let task: IntegralTask = drone.decode_task()?;
    info!("integrating {} steps from {}", task.steps, task.left);

    let acc = summing(0.0);
    drone.distribute(&task, integral::midpoint_sin, &acc)?;
    let answer = acc.into_inner();

    drone.send_result(&answer.to_bytes())?;
    info!("sent answer {}", answer);
    drone.finish()?;
    Ok(())
}
