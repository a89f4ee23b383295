//! Packet radio protocol engine
//!
//! Bell 202 AFSK (1200 baud) demodulation, HDLC framing with CSMA channel
//! access, AX.25 addressing and a WIDE1-1 fill-in relay, built around a
//! reference-counted buffer arena so received frames fan out without copying.

pub mod error;
pub mod config;
pub mod crc;
pub mod arena;
pub mod queue;
pub mod ring;
pub mod afsk;
pub mod hdlc;
pub mod ax25;
pub mod heard;
pub mod digipeater;
pub mod monitor;
pub mod rx;

pub use arena::{Arena, Frame};
pub use ax25::{Addr, Header};
pub use digipeater::Digipeater;
pub use error::{Result, TncError};
pub use hdlc::{Deframer, Framer, Subscribers};
pub use queue::FrameQueue;
pub use rx::Receiver;

// Audio configuration
pub const SAMPLE_RATE: usize = 9600;
pub const BIT_RATE: usize = 1200;
pub const MARK_FREQ: f32 = 1200.0; // Hz
pub const SPACE_FREQ: f32 = 2200.0; // Hz

// Queue configuration
pub const QUEUE_SIZE: usize = 16;
pub const SAMPLE_RING_SIZE: usize = SAMPLE_RATE; // 1 s of audio
