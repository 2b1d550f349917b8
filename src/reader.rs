use std::{
    collections::HashMap,
    io::Read,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc as std_mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use serde::Deserialize;
use serialport::{DataBits, Parity, SerialPort, StopBits};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::{
    epc::Epc,
    error::{Error, Result},
    frame::{self, Response, Splitter},
};

const BAUD: u32 = 115_200;
const PROBE_TIMEOUT: Duration = Duration::from_millis(200);
const ACK_TIMEOUT: Duration = Duration::from_millis(200);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);
const CONFIG_RETRIES: u32 = 3;
const REOPEN_DELAY: Duration = Duration::from_millis(100);

// Multi-polling round count handed to the reader firmware per issued command.
const MULTI_POLL_ROUNDS: u16 = 10;

pub const DEFAULT_TX_POWER_DBM: u16 = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Region {
    #[default]
    Eu,
    Us,
    Cn,
    In,
    Jp,
}

impl Region {
    pub fn code(self) -> u8 {
        match self {
            Region::Us => 0x01,
            Region::Eu => 0x02,
            Region::In => 0x03,
            Region::Cn => 0x04,
            Region::Jp => 0x05,
        }
    }

    pub fn max_power_dbm(self) -> u16 {
        match self {
            Region::Eu => 26,
            _ => 30,
        }
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "EU" => Ok(Region::Eu),
            "US" => Ok(Region::Us),
            "CN" => Ok(Region::Cn),
            "IN" => Ok(Region::In),
            "JP" => Ok(Region::Jp),
            other => Err(format!("unknown region '{other}' (EU, US, CN, IN, JP)")),
        }
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Region::Eu => "EU",
            Region::Us => "US",
            Region::Cn => "CN",
            Region::In => "IN",
            Region::Jp => "JP",
        };
        f.write_str(name)
    }
}

impl<'de> Deserialize<'de> for Region {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Region::from_str(&s).map_err(serde::de::Error::custom)
    }
}

pub struct Reader {
    port: Box<dyn SerialPort>,
    path: String,
    splitter: Splitter,
}

impl Reader {
    /// Walks the available serial ports until one answers the probe, then
    /// configures the regulatory region and transmit power.
    pub fn open(region: Region, power_dbm: u16, port_override: Option<&str>) -> Result<Self> {
        let candidates = match port_override {
            Some(path) => vec![path.to_string()],
            None => enumerate_ports()?,
        };

        for path in &candidates {
            match Self::probe(path) {
                Ok(mut reader) => {
                    reader.configure(region, power_dbm)?;
                    reader.port.set_timeout(DRAIN_TIMEOUT)?;
                    info!("RFID reader on {path}, region {region}, {power_dbm} dBm");
                    return Ok(reader);
                }
                Err(err) => debug!("No reader on {path}: {err}"),
            }
        }

        Err(Error::DeviceUnavailable {
            device: "rfid reader",
            reason: format!("no reader answered on {} candidate port(s)", candidates.len()),
        })
    }

    fn probe(path: &str) -> Result<Self> {
        let port = open_port(path, PROBE_TIMEOUT)?;
        let mut reader = Self {
            port,
            path: path.to_string(),
            splitter: Splitter::new(),
        };

        reader.send(frame::CMD_GET_INFO, &[0x00])?;
        let deadline = Instant::now() + PROBE_TIMEOUT;
        if reader.await_frame(deadline)?.is_some() {
            Ok(reader)
        } else {
            Err(Error::DeviceUnavailable {
                device: "rfid reader",
                reason: format!("no probe answer on {path}"),
            })
        }
    }

    fn configure(&mut self, region: Region, power_dbm: u16) -> Result<()> {
        self.command_with_ack(frame::CMD_SET_REGION, &[region.code()])?;

        let centi_dbm = power_dbm * 100;
        self.command_with_ack(frame::CMD_SET_TX_POWER, &centi_dbm.to_be_bytes())?;
        Ok(())
    }

    fn command_with_ack(&mut self, cmd: u8, payload: &[u8]) -> Result<()> {
        for attempt in 1..=CONFIG_RETRIES {
            self.send(cmd, payload)?;
            let deadline = Instant::now() + ACK_TIMEOUT;
            loop {
                match self.await_frame(deadline)? {
                    Some(Response::ConfigAck { cmd: acked }) if acked == cmd => return Ok(()),
                    Some(_) => continue,
                    None => break,
                }
            }
            debug!("No ACK for command 0x{cmd:02X} (attempt {attempt}/{CONFIG_RETRIES})");
        }

        Err(Error::DeviceUnavailable {
            device: "rfid reader",
            reason: format!("command 0x{cmd:02X} was never acknowledged"),
        })
    }

    /// Multi-polling inventory: returns `Epc → best RSSI` once `target`
    /// distinct tags are seen, `Timeout` at the deadline, `Cancelled` when the
    /// flag is raised. Result ordering is whatever the map yields.
    pub fn read_tags(
        &mut self,
        target: usize,
        deadline: Instant,
        poll_interval: Duration,
        cancel: &AtomicBool,
    ) -> Result<HashMap<Epc, i8>> {
        let mut seen: HashMap<Epc, i8> = HashMap::new();
        let mut reopened = false;

        loop {
            if cancel.load(Ordering::Relaxed) {
                self.stop_polling();
                return Err(Error::Cancelled);
            }
            if Instant::now() >= deadline {
                self.stop_polling();
                return Err(Error::Timeout);
            }

            if let Err(err) = self.send_multi_poll() {
                self.recover(&mut reopened, &err)?;
                continue;
            }

            let tick_end = Instant::now() + poll_interval;
            while Instant::now() < tick_end {
                match self.drain_responses() {
                    Ok(responses) => {
                        for response in responses {
                            absorb(&mut seen, response);
                            // never hand back more than the target count
                            if seen.len() >= target {
                                self.stop_polling();
                                return Ok(seen);
                            }
                        }
                    }
                    Err(err) => {
                        self.recover(&mut reopened, &err)?;
                        break;
                    }
                }

                if cancel.load(Ordering::Relaxed) {
                    self.stop_polling();
                    return Err(Error::Cancelled);
                }
            }
        }
    }

    /// One multi-poll pass; returns the number of distinct tags that answered
    /// within the window. Used to decide whether the tray has been cleared.
    pub fn poll_presence(&mut self, window: Duration) -> Result<usize> {
        let mut seen: HashMap<Epc, i8> = HashMap::new();
        let mut reopened = false;

        if let Err(err) = self.send_multi_poll() {
            self.recover(&mut reopened, &err)?;
            self.send_multi_poll()?;
        }

        let tick_end = Instant::now() + window;
        while Instant::now() < tick_end {
            match self.drain_responses() {
                Ok(responses) => {
                    for response in responses {
                        absorb(&mut seen, response);
                    }
                }
                Err(err) => {
                    self.recover(&mut reopened, &err)?;
                }
            }
        }
        self.stop_polling();

        Ok(seen.len())
    }

    fn send_multi_poll(&mut self) -> Result<()> {
        let rounds = MULTI_POLL_ROUNDS.to_be_bytes();
        self.send(frame::CMD_MULTI_POLL, &[0x22, rounds[0], rounds[1]])
    }

    fn stop_polling(&mut self) {
        if let Err(err) = self.send(frame::CMD_STOP_MULTI_POLL, &[]) {
            debug!("Failed to stop multi-polling: {err}");
        }
    }

    fn send(&mut self, cmd: u8, payload: &[u8]) -> Result<()> {
        let bytes = frame::encode(cmd, payload);
        std::io::Write::write_all(&mut self.port, &bytes)?;
        Ok(())
    }

    /// Reads whatever arrived within the short drain timeout and decodes it.
    /// Desyncs are logged and swallowed; garbage never aborts the loop.
    fn drain_responses(&mut self) -> Result<Vec<Response>> {
        let mut chunk = [0u8; 256];
        match self.port.read(&mut chunk) {
            Ok(0) => {}
            Ok(n) => self.splitter.push(&chunk[..n]),
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => return Err(err.into()),
        }

        match self.splitter.responses() {
            Ok(responses) => Ok(responses),
            Err(err) => {
                warn!("RFID stream desynced: {err}");
                Ok(Vec::new())
            }
        }
    }

    fn await_frame(&mut self, deadline: Instant) -> Result<Option<Response>> {
        while Instant::now() < deadline {
            let mut responses = self.drain_responses()?;
            if let Some(response) = responses.pop() {
                return Ok(Some(response));
            }
        }
        Ok(None)
    }

    fn recover(&mut self, reopened: &mut bool, err: &Error) -> Result<()> {
        if *reopened {
            return Err(Error::DeviceLost {
                device: "rfid reader",
                reason: err.to_string(),
            });
        }

        warn!("RFID I/O error, reopening {}: {err}", self.path);
        thread::sleep(REOPEN_DELAY);
        self.port = open_port(&self.path, DRAIN_TIMEOUT)?;
        self.splitter = Splitter::new();
        *reopened = true;
        Ok(())
    }
}

fn open_port(path: &str, timeout: Duration) -> Result<Box<dyn SerialPort>> {
    let port = serialport::new(path, BAUD)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .timeout(timeout)
        .open()?;
    Ok(port)
}

fn enumerate_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

fn absorb(seen: &mut HashMap<Epc, i8>, response: Response) {
    match response {
        Response::TagNotice { rssi, epc } => {
            seen.entry(epc)
                .and_modify(|best| *best = (*best).max(rssi))
                .or_insert(rssi);
        }
        Response::InventoryEnd => {}
        Response::ConfigAck { .. } => {}
        Response::Error { code } => debug!("Reader reported error 0x{code:02X}"),
    }
}

#[derive(Debug)]
pub enum InventoryReport {
    Complete(HashMap<Epc, i8>),
    TimedOut,
    Cancelled,
    Lost(String),
}

enum WorkerCmd {
    Collect {
        target: usize,
        timeout: Duration,
        reply: oneshot::Sender<InventoryReport>,
    },
    Presence {
        window: Duration,
        reply: oneshot::Sender<Result<usize>>,
    },
    Shutdown,
}

/// Owns the reader on a dedicated thread; the control task requests one
/// inventory snapshot at a time and may cancel the in-flight one.
pub struct ReaderHandle {
    cmd_tx: std_mpsc::Sender<WorkerCmd>,
    cancel: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
}

impl ReaderHandle {
    pub fn spawn(mut reader: Reader, poll_interval: Duration) -> Self {
        let (cmd_tx, cmd_rx) = std_mpsc::channel::<WorkerCmd>();
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_for_worker = Arc::clone(&cancel);

        let worker = thread::spawn(move || {
            while let Ok(cmd) = cmd_rx.recv() {
                match cmd {
                    WorkerCmd::Collect {
                        target,
                        timeout,
                        reply,
                    } => {
                        cancel_for_worker.store(false, Ordering::Relaxed);
                        let deadline = Instant::now() + timeout;
                        let report = match reader.read_tags(
                            target,
                            deadline,
                            poll_interval,
                            &cancel_for_worker,
                        ) {
                            Ok(map) => InventoryReport::Complete(map),
                            Err(Error::Timeout) => InventoryReport::TimedOut,
                            Err(Error::Cancelled) => InventoryReport::Cancelled,
                            Err(err) => {
                                error!("Inventory failed: {err}");
                                InventoryReport::Lost(err.to_string())
                            }
                        };
                        let _ = reply.send(report);
                    }
                    WorkerCmd::Presence { window, reply } => {
                        let _ = reply.send(reader.poll_presence(window));
                    }
                    WorkerCmd::Shutdown => break,
                }
            }
            debug!("RFID worker stopped");
        });

        Self {
            cmd_tx,
            cancel,
            worker: Some(worker),
        }
    }

    pub async fn collect(&self, target: usize, timeout: Duration) -> InventoryReport {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(WorkerCmd::Collect {
                target,
                timeout,
                reply: reply_tx,
            })
            .is_err()
        {
            return InventoryReport::Lost("rfid worker is gone".to_string());
        }

        match reply_rx.await {
            Ok(report) => report,
            Err(_) => InventoryReport::Lost("rfid worker dropped the reply".to_string()),
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub async fn presence(&self, window: Duration) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(WorkerCmd::Presence {
                window,
                reply: reply_tx,
            })
            .map_err(|_| Error::DeviceLost {
                device: "rfid reader",
                reason: "worker is gone".to_string(),
            })?;

        reply_rx.await.map_err(|_| Error::DeviceLost {
            device: "rfid reader",
            reason: "worker dropped the reply".to_string(),
        })?
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        let _ = self.cmd_tx.send(WorkerCmd::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        info!("RFID reader stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_codes_match_firmware_table() {
        assert_eq!(Region::Us.code(), 0x01);
        assert_eq!(Region::Eu.code(), 0x02);
        assert_eq!(Region::In.code(), 0x03);
        assert_eq!(Region::Cn.code(), 0x04);
        assert_eq!(Region::Jp.code(), 0x05);
    }

    #[test]
    fn region_parses_case_insensitively() {
        assert_eq!("eu".parse::<Region>(), Ok(Region::Eu));
        assert_eq!(" JP ".parse::<Region>(), Ok(Region::Jp));
        assert!("XX".parse::<Region>().is_err());
    }

    #[test]
    fn absorb_keeps_best_rssi_per_tag() {
        let mut seen = HashMap::new();
        let epc = Epc::from_bytes(&[0x01, 0x02]);

        absorb(
            &mut seen,
            Response::TagNotice {
                rssi: -70,
                epc: epc.clone(),
            },
        );
        absorb(
            &mut seen,
            Response::TagNotice {
                rssi: -55,
                epc: epc.clone(),
            },
        );
        absorb(
            &mut seen,
            Response::TagNotice {
                rssi: -80,
                epc: epc.clone(),
            },
        );

        assert_eq!(seen.len(), 1);
        assert_eq!(seen[&epc], -55);
    }

    #[test]
    fn absorb_ignores_non_tag_responses() {
        let mut seen = HashMap::new();
        absorb(&mut seen, Response::InventoryEnd);
        absorb(&mut seen, Response::ConfigAck { cmd: 0x07 });
        absorb(&mut seen, Response::Error { code: 0x09 });
        assert!(seen.is_empty());
    }
}
