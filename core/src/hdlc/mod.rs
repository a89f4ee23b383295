//! HDLC link layer: deframer (receive) and framer (transmit)

pub mod decoder;
pub mod encoder;

pub use decoder::{Deframer, DeframerStats, Subscribers, SUBSCRIBER_MONITOR, SUBSCRIBER_RELAY, SUBSCRIBER_GATEWAY};
pub use encoder::{AfskLoopback, Framer, FramerStatus, Radio};

pub const HDLC_FLAG: u8 = 0x7E;
/// Largest accepted frame, FCS included
pub const MAX_FRAME_SIZE: usize = 289;
/// Frames up to this length (FCS included) are dropped without a checksum test
pub const MIN_FRAME_SIZE: usize = 16;
