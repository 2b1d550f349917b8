use crate::epc::Epc;
use crate::error::{Error, Result};

pub const HEADER: u8 = 0xBB;
pub const TAIL: u8 = 0x7E;

pub const TYPE_COMMAND: u8 = 0x00;
pub const TYPE_RESPONSE: u8 = 0x01;
pub const TYPE_NOTICE: u8 = 0x02;

pub const CMD_GET_INFO: u8 = 0x03;
pub const CMD_SET_REGION: u8 = 0x07;
pub const CMD_MULTI_POLL: u8 = 0x27;
pub const CMD_STOP_MULTI_POLL: u8 = 0x28;
pub const CMD_SET_TX_POWER: u8 = 0xB6;
pub const CMD_ERROR: u8 = 0xFF;

const ERR_INVENTORY_END: u8 = 0x15;

// A tag notice payload is RSSI(1) PC(2) EPC(n) CRC(2).
const NOTICE_OVERHEAD: usize = 5;

// Declared payload lengths beyond this are treated as line noise.
const MAX_PAYLOAD: usize = 0x400;

// How many bytes may be consumed without a single valid frame before the
// stream is reported as malformed.
const RESYNC_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub cmd: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    TagNotice { rssi: i8, epc: Epc },
    InventoryEnd,
    ConfigAck { cmd: u8 },
    Error { code: u8 },
}

impl Frame {
    pub fn response(&self) -> Option<Response> {
        match (self.frame_type, self.cmd) {
            (TYPE_NOTICE, CMD_MULTI_POLL) => {
                if self.payload.len() <= NOTICE_OVERHEAD {
                    return None;
                }
                let rssi = self.payload[0] as i8;
                let epc = Epc::from_bytes(&self.payload[3..self.payload.len() - 2]);
                Some(Response::TagNotice { rssi, epc })
            }
            (TYPE_RESPONSE, CMD_ERROR) => match self.payload.first() {
                Some(&ERR_INVENTORY_END) => Some(Response::InventoryEnd),
                Some(&code) => Some(Response::Error { code }),
                None => None,
            },
            (TYPE_RESPONSE, cmd) => Some(Response::ConfigAck { cmd }),
            _ => None,
        }
    }
}

pub fn encode(cmd: u8, payload: &[u8]) -> Vec<u8> {
    let len = u16::try_from(payload.len()).expect("payload fits a frame");
    let mut out = Vec::with_capacity(payload.len() + 7);
    out.push(HEADER);
    out.push(TYPE_COMMAND);
    out.push((len >> 8) as u8);
    out.push((len & 0xFF) as u8);
    out.push(cmd);
    out.extend_from_slice(payload);
    out.push(checksum(&out[1..]));
    out.push(TAIL);
    out
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Incremental frame scanner over a raw byte stream. Garbage between frames
/// is consumed silently; the scanner realigns on the next header byte.
#[derive(Debug, Default)]
pub struct Splitter {
    buf: Vec<u8>,
    junk: usize,
}

impl Splitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            let Some(start) = self.buf.iter().position(|&b| b == HEADER) else {
                self.consume_junk(self.buf.len());
                self.buf.clear();
                return self.check_sync();
            };
            self.consume_junk(start);
            self.buf.drain(..start);

            // header(1) type(1) len(2) cmd(1)
            if self.buf.len() < 5 {
                return self.check_sync();
            }

            let declared = (usize::from(self.buf[2]) << 8) | usize::from(self.buf[3]);
            if declared > MAX_PAYLOAD {
                self.skip_header();
                continue;
            }

            let total = 5 + declared + 2;
            if self.buf.len() < total {
                if self.buf.len() + self.junk > RESYNC_LIMIT {
                    return self.desync(self.buf.len());
                }
                return Ok(None);
            }

            if self.buf[total - 1] != TAIL || checksum(&self.buf[1..total - 2]) != self.buf[total - 2]
            {
                self.skip_header();
                continue;
            }

            let frame = Frame {
                frame_type: self.buf[1],
                cmd: self.buf[4],
                payload: self.buf[5..5 + declared].to_vec(),
            };
            self.buf.drain(..total);
            self.junk = 0;
            return Ok(Some(frame));
        }
    }

    pub fn responses(&mut self) -> Result<Vec<Response>> {
        let mut out = Vec::new();
        while let Some(frame) = self.next_frame()? {
            if let Some(response) = frame.response() {
                out.push(response);
            }
        }
        Ok(out)
    }

    fn skip_header(&mut self) {
        self.buf.drain(..1);
        self.junk += 1;
    }

    fn consume_junk(&mut self, dropped: usize) {
        self.junk += dropped;
    }

    fn check_sync(&mut self) -> Result<Option<Frame>> {
        if self.junk > RESYNC_LIMIT {
            return self.desync(0);
        }
        Ok(None)
    }

    fn desync(&mut self, pending: usize) -> Result<Option<Frame>> {
        let lost = self.junk + pending;
        self.junk = 0;
        self.buf.clear();
        Err(Error::MalformedFrame(lost))
    }
}
