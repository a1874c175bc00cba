#![allow(dead_code)]

use std::time::{Duration, Instant};
use uhf_reader::sim::{SimHandle, SimTag, SimulatedReader};
use uhf_reader::{ReadPlan, Reader, ReaderConfig, TagProtocol};

pub type SimReader = Reader<SimulatedReader>;

pub fn config() -> ReaderConfig {
    ReaderConfig::default()
        .with_command_timeout(Duration::from_millis(500))
        .with_stop_grace(Duration::from_secs(5))
}

/// Connected reader with the region still unset
pub fn connect() -> (SimReader, SimHandle) {
    connect_with(config())
}

pub fn connect_with(config: ReaderConfig) -> (SimReader, SimHandle) {
    let (transport, sim) = SimulatedReader::new();
    sim.set_cycle_time(Some(Duration::from_millis(5)));
    let reader = Reader::connect(transport, config).unwrap();
    (reader, sim)
}

/// Connected reader with a resolved region and a plan on antenna 1
pub fn ready() -> (SimReader, SimHandle) {
    ready_with(config())
}

pub fn ready_with(config: ReaderConfig) -> (SimReader, SimHandle) {
    let (reader, sim) = connect_with(config);
    reader.resolve_region().unwrap();
    reader
        .commit_plan(&ReadPlan::simple(&[1], TagProtocol::Gen2, 1000).unwrap())
        .unwrap();
    (reader, sim)
}

pub fn tag(epc: &[u8]) -> SimTag {
    SimTag::gen2(epc).unwrap()
}

/// Poll `condition` until it holds or two seconds pass
pub fn wait_for(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}
