//! AX.25 address field and header codec
//!
//! Each address is seven octets on the wire: six callsign characters shifted
//! left by one (space padded) and one SSID octet carrying the sub-station id,
//! the has-been-relayed/command bit and the last-address bit.

use crate::arena::Frame;
use crate::config::StationConfig;
use crate::error::{Result, TncError};
use std::fmt;
use std::str::FromStr;

pub const FLAG_LAST: u8 = 0x01;
/// Has-been-relayed on a repeater address, command/response on dest/src
pub const FLAG_DIGI: u8 = 0x80;
pub const FLAG_CMD: u8 = 0x80;

pub const FTYPE_UI: u8 = 0x03;
pub const PID_NO_L3: u8 = 0xF0;

pub const MAX_DIGIS: usize = 7;
pub const ADDR_LEN: usize = 7;

/// Length of a UI/I header with `ndigis` repeater addresses
pub const fn header_len(ndigis: usize) -> usize {
    14 + 2 + ndigis * ADDR_LEN
}

/// One station address
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr {
    call: [u8; 6],
    len: u8,
    pub ssid: u8,
    pub flags: u8,
}

impl Addr {
    pub fn new(callsign: &str, ssid: u8) -> Result<Self> {
        let callsign = callsign.trim();
        if callsign.is_empty() || callsign.len() > 6 {
            return Err(TncError::InvalidAddress(callsign.to_string()));
        }
        if !callsign.bytes().all(|c| c.is_ascii_alphanumeric()) {
            return Err(TncError::InvalidAddress(callsign.to_string()));
        }
        if ssid > 15 {
            return Err(TncError::InvalidAddress(format!("{}-{}", callsign, ssid)));
        }
        let mut call = [b' '; 6];
        for (dst, src) in call.iter_mut().zip(callsign.bytes()) {
            *dst = src.to_ascii_uppercase();
        }
        Ok(Self {
            call,
            len: callsign.len() as u8,
            ssid,
            flags: 0,
        })
    }

    /// Parse `CALL-SSID` and mark the address as already relayed
    pub fn relayed(s: &str) -> Result<Self> {
        let mut addr: Addr = s.parse()?;
        addr.flags |= FLAG_DIGI;
        Ok(addr)
    }

    pub fn callsign(&self) -> &str {
        std::str::from_utf8(&self.call[..self.len as usize]).unwrap_or("")
    }

    pub fn is_relayed(&self) -> bool {
        self.flags & FLAG_DIGI != 0
    }

    pub fn is_last(&self) -> bool {
        self.flags & FLAG_LAST != 0
    }

    /// Same callsign and SSID, flags ignored
    pub fn same_station(&self, other: &Addr) -> bool {
        self.call == other.call && self.ssid == other.ssid
    }

    /// Case-insensitive callsign prefix match
    pub fn callsign_starts_with(&self, prefix: &str) -> bool {
        let call = self.callsign().as_bytes();
        prefix.len() <= call.len() && call[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    }

    pub fn encode_into(&self, out: &mut [u8; ADDR_LEN], flags: u8) {
        for (dst, &c) in out.iter_mut().zip(self.call.iter()) {
            *dst = c << 1;
        }
        out[6] = ((self.ssid & 0x0F) << 1) | (flags & (FLAG_DIGI | FLAG_LAST)) | 0x60;
    }

    pub fn decode(raw: &[u8; ADDR_LEN]) -> Self {
        let mut call = [b' '; 6];
        let mut len = 0;
        for &b in &raw[..6] {
            let c = b >> 1;
            if c != b' ' {
                call[len] = c;
                len += 1;
            }
        }
        Self {
            call,
            len: len as u8,
            ssid: (raw[6] & 0x1E) >> 1,
            flags: raw[6] & (FLAG_DIGI | FLAG_LAST),
        }
    }
}

impl FromStr for Addr {
    type Err = TncError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        match s.split_once('-') {
            Some((call, ssid)) => {
                let ssid = ssid
                    .parse::<u8>()
                    .map_err(|_| TncError::InvalidAddress(s.to_string()))?;
                Addr::new(call, ssid)
            }
            None => Addr::new(s, 0),
        }
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ssid == 0 {
            write!(f, "{}", self.callsign())
        } else {
            write!(f, "{}-{}", self.callsign(), self.ssid)
        }
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Addr({}", self)?;
        if self.is_relayed() {
            write!(f, "*")?;
        }
        write!(f, ")")
    }
}

/// Parse a comma separated repeater path like `WIDE1-1,WIDE2-2`
pub fn parse_path(s: &str) -> Result<Vec<Addr>> {
    let path = s
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| match t.strip_suffix('*') {
            Some(t) => Addr::relayed(t),
            None => t.parse(),
        })
        .collect::<Result<Vec<_>>>()?;
    if path.len() > MAX_DIGIS {
        return Err(TncError::PathTooLong);
    }
    Ok(path)
}

/// Format a repeater path. `truncate` abbreviates WIDE aliases (`W1`, `W2`).
pub fn format_path(path: &[Addr], truncate: bool) -> String {
    if path.is_empty() {
        return "<EMPTY>".to_string();
    }
    path.iter()
        .map(|a| {
            let s = a.to_string();
            if !truncate {
                s
            } else if s == "WIDE1-1" {
                "W1".to_string()
            } else if s == "WIDE2-2" {
                "W2".to_string()
            } else if let Some(rest) = s.strip_prefix("WIDE") {
                format!("W{}", rest)
            } else {
                s
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// True when any pattern is a prefix of some address in the path
pub fn search_path(path: &[Addr], patterns: &[&str]) -> bool {
    patterns
        .iter()
        .any(|p| path.iter().any(|a| a.to_string().starts_with(p)))
}

/// Decoded link-layer header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub dest: Addr,
    pub src: Addr,
    pub path: Vec<Addr>,
    pub control: u8,
    pub pid: u8,
}

impl Header {
    /// UI header with no layer 3 protocol
    pub fn ui(src: Addr, dest: Addr, path: Vec<Addr>) -> Self {
        Self {
            dest,
            src,
            path,
            control: FTYPE_UI,
            pid: PID_NO_L3,
        }
    }

    /// UI header built from the station settings
    pub fn from_station(station: &StationConfig) -> Result<Self> {
        Ok(Self::ui(
            station.mycall.parse()?,
            station.dest.parse()?,
            parse_path(&station.path)?,
        ))
    }

    fn has_pid(&self) -> bool {
        self.control & 0x01 == 0 || self.control == FTYPE_UI
    }

    /// Encoded length in bytes
    pub fn len(&self) -> usize {
        14 + self.path.len() * ADDR_LEN + 1 + self.has_pid() as usize
    }

    pub fn encode_to_vec(&self) -> Result<Vec<u8>> {
        if self.path.len() > MAX_DIGIS {
            return Err(TncError::PathTooLong);
        }
        let mut out = Vec::with_capacity(self.len());
        let mut raw = [0u8; ADDR_LEN];
        self.dest.encode_into(&mut raw, self.dest.flags & FLAG_CMD);
        out.extend_from_slice(&raw);
        let last = if self.path.is_empty() { FLAG_LAST } else { 0 };
        self.src.encode_into(&mut raw, (self.src.flags & FLAG_CMD) | last);
        out.extend_from_slice(&raw);
        for (i, digi) in self.path.iter().enumerate() {
            let last = if i + 1 == self.path.len() { FLAG_LAST } else { 0 };
            digi.encode_into(&mut raw, (digi.flags & FLAG_DIGI) | last);
            out.extend_from_slice(&raw);
        }
        out.push(self.control);
        if self.has_pid() {
            out.push(self.pid);
        }
        Ok(out)
    }

    /// Append the encoded header to a writable frame
    pub fn encode(&self, frame: &mut Frame) -> Result<()> {
        frame.write(&self.encode_to_vec()?)
    }

    /// Decode the header at the start of a byte slice
    pub fn decode_bytes(data: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let mut next_addr = |data: &[u8]| -> Result<Addr> {
            let raw: &[u8; ADDR_LEN] = data
                .get(pos..pos + ADDR_LEN)
                .and_then(|s| s.try_into().ok())
                .ok_or(TncError::FrameTooShort)?;
            pos += ADDR_LEN;
            Ok(Addr::decode(raw))
        };

        let dest = next_addr(data)?;
        let src = next_addr(data)?;
        let mut path = Vec::new();
        if !src.is_last() {
            while path.len() < MAX_DIGIS {
                let digi = next_addr(data)?;
                path.push(digi);
                if digi.is_last() {
                    break;
                }
            }
        }
        let hdr_end = 14 + path.len() * ADDR_LEN;
        let control = *data.get(hdr_end).ok_or(TncError::FrameTooShort)?;
        let mut header = Self {
            dest,
            src,
            path,
            control,
            pid: 0,
        };
        if header.has_pid() {
            header.pid = *data.get(hdr_end + 1).ok_or(TncError::FrameTooShort)?;
        }
        Ok(header)
    }

    /// Decode the header of a frame, leaving the read position at the payload
    pub fn decode(frame: &mut Frame) -> Result<Self> {
        frame.rewind();
        let mut buf = [0u8; header_len(MAX_DIGIS)];
        let n = frame.read_into(&mut buf);
        let header = Self::decode_bytes(&buf[..n])?;
        frame.seek(header.len())?;
        Ok(header)
    }

    pub fn is_ui(&self) -> bool {
        self.control == FTYPE_UI
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}>{}", self.src, self.dest)?;
        for digi in &self.path {
            write!(f, ",{}", digi)?;
            if digi.is_relayed() {
                write!(f, "*")?;
            }
        }
        Ok(())
    }
}

/// Render a frame as `SRC>DEST,DIGI*,...:info`
pub fn display_frame(frame: &mut Frame) -> Result<String> {
    let header = Header::decode(frame)?;
    let mut out = header.to_string();
    if header.is_ui() {
        out.push(':');
        out.extend(
            frame
                .read_remaining()
                .into_iter()
                .filter(|&c| c != b'\n' && c != b'\r' && c >= 28)
                .map(char::from),
        );
    }
    Ok(out)
}
