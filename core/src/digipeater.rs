//! Relay (digipeater) policy
//!
//! Receives frames from the deframer's relay subscription and decides whether
//! to repeat them:
//!
//! - fill-in mode repeats frames whose next unused path entry is `WIDE1-1`
//! - SAR override repeats frames carrying a `SAR` alias anywhere in the path,
//!   as long as nobody has relayed them yet
//!
//! The repeated frame gets a rewritten header with our own call marked as
//! relayed. The payload is not copied: the new header is connected to the
//! tail of the received frame.

use crate::arena::{Arena, Frame};
use crate::ax25::{Addr, Header, FLAG_DIGI, MAX_DIGIS};
use crate::config::RelayConfig;
use crate::error::{Result, TncError};
use crate::heard::{fingerprint, SharedHeardList};
use crate::queue::FrameQueue;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why a frame was not repeated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    Duplicate,
    PathComplete,
    NoMatchingAlias,
    Undecodable,
}

pub struct Digipeater {
    arena: Arc<Arena>,
    mycall: Addr,
    config: RelayConfig,
    heard: SharedHeardList,
    output: FrameQueue,
}

impl Digipeater {
    pub fn new(
        arena: Arc<Arena>,
        mycall: Addr,
        config: RelayConfig,
        heard: SharedHeardList,
        output: FrameQueue,
    ) -> Self {
        Self {
            arena,
            mycall,
            config,
            heard,
            output,
        }
    }

    /// Rewritten path for a received header, or the reason not to relay
    pub fn relay_path(&self, header: &Header) -> std::result::Result<Vec<Addr>, Skip> {
        let path = &header.path;
        let done = path.iter().take_while(|a| a.is_relayed()).count();
        if done == path.len() {
            return Err(Skip::PathComplete);
        }

        let wide1 = self.config.wide1_fill_in
            && path[done].callsign_starts_with("WIDE1")
            && path[done].ssid == 1;
        let sar_pos = if self.config.sar_override && done == 0 {
            path.iter().position(|a| a.callsign_starts_with("SAR"))
        } else {
            None
        };
        if sar_pos.is_none() && !wide1 {
            return Err(Skip::NoMatchingAlias);
        }

        let mut me = self.mycall;
        me.flags = FLAG_DIGI;
        let mut new_path: Vec<Addr> = path[..done].to_vec();
        new_path.push(me);

        // The consumed alias is repeated without SSID and marked used
        let (alias, rest) = match sar_pos {
            Some(i) => (path[i], done),
            None => (path[done], done + 1),
        };
        let mut used = alias;
        used.ssid = 0;
        used.flags = FLAG_DIGI;
        new_path.push(used);
        new_path.extend(
            path.iter()
                .enumerate()
                .skip(rest)
                .filter(|(i, _)| Some(*i) != sar_pos)
                .map(|(_, a)| *a),
        );
        Ok(new_path)
    }

    /// Check one received frame. Returns the frame to transmit, if any.
    pub fn process(&self, frame: &mut Frame) -> Result<std::result::Result<Frame, Skip>> {
        let Ok(header) = Header::decode(frame) else {
            return Ok(Err(Skip::Undecodable));
        };
        let fp = fingerprint(&header, frame);
        if self.heard.lock().duplicate(fp) {
            debug!("Heard {} before, not repeating", header);
            return Ok(Err(Skip::Duplicate));
        }
        let path = match self.relay_path(&header) {
            Ok(path) => path,
            Err(skip) => return Ok(Err(skip)),
        };
        if path.len() > MAX_DIGIS {
            warn!("Relay path for {} would exceed {} entries", header, MAX_DIGIS);
            return Err(TncError::PathTooLong);
        }

        let rewritten = Header { path, ..header.clone() };
        let mut out = self.arena.acquire()?;
        rewritten.encode(&mut out)?;
        out.connect(frame, header.len())?;
        info!("Repeating {} as {}", header, rewritten);
        Ok(Ok(out))
    }

    /// Handle frames from `input` until a sentinel arrives or `shutdown` is
    /// set
    pub fn run(&self, input: &FrameQueue, shutdown: &AtomicBool) {
        debug!("Digipeater started as {}", self.mycall);
        while !shutdown.load(Ordering::Relaxed) {
            let mut frame = match input.get_timeout(POLL_INTERVAL) {
                Ok(frame) => frame,
                Err(TncError::Timeout) => continue,
                Err(_) => break,
            };
            if frame.is_empty() {
                break;
            }
            match self.process(&mut frame) {
                Ok(Ok(out)) => {
                    if self.output.put(out).is_err() {
                        warn!("Transmit queue closed");
                        break;
                    }
                }
                Ok(Err(skip)) => debug!("Not repeated: {:?}", skip),
                Err(e) => warn!("Relay failed: {}", e),
            }
        }
        debug!("Digipeater stopped");
    }

    pub fn spawn(self, input: FrameQueue, shutdown: Arc<AtomicBool>) -> JoinHandle<()> {
        thread::spawn(move || self.run(&input, &shutdown))
    }
}
