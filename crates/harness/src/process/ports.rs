use std::collections::{BTreeSet, HashMap};
use std::net::TcpListener;

use parking_lot::Mutex;

use crate::error::{HarnessError, Result};

struct PortPool {
    start: u16,
    end: u16,
    available: BTreeSet<u16>,
    allocated: HashMap<u16, String>,
}

/// Hands out listening ports for managed processes.
///
/// Ports come from a fixed range, minus whatever the host already has in
/// use. Each allocation is tagged with the name of the process that owns it
/// and stays reserved across restarts until released.
pub struct PortAllocator {
    host: String,
    probe: bool,
    pool: Mutex<PortPool>,
}

impl PortAllocator {
    pub fn new(host: impl Into<String>, (start, end): (u16, u16)) -> Self {
        let mut available: BTreeSet<u16> = (start..=end).collect();
        for port in scan_host_ports() {
            available.remove(&port);
        }
        Self {
            host: host.into(),
            probe: true,
            pool: Mutex::new(PortPool { start, end, available, allocated: HashMap::new() }),
        }
    }

    /// No host scan and no bind probe.
    #[cfg(test)]
    fn unprobed(start: u16, end: u16) -> Self {
        let available: BTreeSet<u16> = (start..=end).collect();
        Self {
            host: "127.0.0.1".into(),
            probe: false,
            pool: Mutex::new(PortPool { start, end, available, allocated: HashMap::new() }),
        }
    }

    /// Allocate the lowest free port for `owner`.
    ///
    /// Ports that turn out to be unbindable are dropped from the pool and
    /// the next one is tried.
    pub fn allocate(&self, owner: &str) -> Result<u16> {
        let mut pool = self.pool.lock();
        while let Some(port) = pool.available.pop_first() {
            if self.probe && !is_bindable(&self.host, port) {
                tracing::debug!(port, "skipping port bound by another process");
                continue;
            }
            pool.allocated.insert(port, owner.to_owned());
            return Ok(port);
        }
        Err(HarnessError::PortExhaustion { start: pool.start, end: pool.end })
    }

    /// Reserve an explicit port. It may lie outside the allocation range.
    pub fn reserve(&self, owner: &str, port: u16) -> Result<()> {
        let mut pool = self.pool.lock();
        let in_use = || HarnessError::PortInUse { host: self.host.clone(), port };
        if pool.allocated.contains_key(&port) {
            return Err(in_use());
        }
        if self.probe && !is_bindable(&self.host, port) {
            return Err(in_use());
        }
        pool.available.remove(&port);
        pool.allocated.insert(port, owner.to_owned());
        Ok(())
    }

    pub fn release(&self, port: u16) {
        let mut pool = self.pool.lock();
        if pool.allocated.remove(&port).is_some() && (pool.start..=pool.end).contains(&port) {
            pool.available.insert(port);
        }
    }

    pub fn owner(&self, port: u16) -> Option<String> {
        self.pool.lock().allocated.get(&port).cloned()
    }

    pub fn allocated(&self) -> usize {
        self.pool.lock().allocated.len()
    }
}

fn is_bindable(host: &str, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

/// Ports with a socket in `/proc/net/tcp{,6}`. Empty off Linux; the bind
/// probe still catches conflicts there.
fn scan_host_ports() -> BTreeSet<u16> {
    let mut ports = BTreeSet::new();
    for path in ["/proc/net/tcp", "/proc/net/tcp6"] {
        if let Ok(contents) = std::fs::read_to_string(path) {
            ports.extend(contents.lines().skip(1).filter_map(parse_proc_net_tcp_line));
        }
    }
    ports
}

/// `sl local_address rem_address ...`, where local_address is `HEX_IP:HEX_PORT`.
fn parse_proc_net_tcp_line(line: &str) -> Option<u16> {
    let local = line.split_whitespace().nth(1)?;
    let hex_port = local.rsplit(':').next()?;
    u16::from_str_radix(hex_port, 16).ok()
}
