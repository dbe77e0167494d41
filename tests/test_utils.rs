#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use hive_pool::drone::accumulator::summing;
use hive_pool::integral::{self, IntegralTask};
use hive_pool::proto::Record;
use hive_pool::{Drone, DroneConfig, Queen, QueenConfig, Release};

/// 测试日志初始化，重复调用无害
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Loopback address on a port nobody is listening on yet
pub fn free_addr() -> SocketAddr {
    let port = portpicker::pick_unused_port().expect("no free port");
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Queen bound to an ephemeral loopback port
pub fn bind_queen(nodes: usize, deadline: Duration) -> (Queen, SocketAddr) {
    let config = QueenConfig::new(SocketAddr::from(([127, 0, 0, 1], 0)), deadline, nodes)
        .unwrap()
        .with_accept_timeout(Duration::from_secs(10));
    let queen = Queen::bind(config).unwrap();
    let addr = queen.local_addr().unwrap();
    (queen, addr)
}

/// Drone that integrates its task the same way `hive-drone` does
pub fn spawn_integral_drone(addr: SocketAddr, cores: usize) -> JoinHandle<hive_pool::Result<Release>> {
    thread::spawn(move || {
        let config = DroneConfig::new(addr, cores, IntegralTask::SIZE)?
            .with_retry_interval(Duration::from_millis(20))
            .with_deadline(Duration::from_secs(10));
        let mut drone = Drone::connect(config)?;
        let task: IntegralTask = drone.decode_task()?;

        let acc = summing(0.0);
        drone.distribute(&task, integral::midpoint_sin, &acc)?;
        drone.send_result(&acc.into_inner().to_bytes())?;
        Ok(drone.finish()?)
    })
}

/// Hand-rolled drone: connects, reports `cores` and reads one task
pub fn raw_drone(addr: SocketAddr, cores: i32, task_size: usize) -> (TcpStream, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(&cores.to_ne_bytes()).unwrap();
    let mut task = vec![0u8; task_size];
    stream.read_exact(&mut task).unwrap();
    (stream, task)
}

/// Read whatever the peer sends until it closes
pub fn drain(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let _ = stream.read_to_end(&mut buf);
    buf
}
