use js_sys::Array;
use packetwave_core::ax25::{parse_path, Header};
use packetwave_core::config::{ArenaConfig, ChannelAccess, DemodConfig};
use packetwave_core::hdlc::{AfskLoopback, SUBSCRIBER_MONITOR};
use packetwave_core::monitor::render;
use packetwave_core::{Arena, Frame, FrameQueue, Framer, Receiver, Subscribers, QUEUE_SIZE};
use std::sync::Arc;
use wasm_bindgen::prelude::*;

fn js_error(e: impl std::fmt::Display) -> JsValue {
    JsValue::from_str(&e.to_string())
}

#[wasm_bindgen]
pub struct WasmEncoder {
    arena: Arc<Arena>,
    header: Header,
}

#[wasm_bindgen]
impl WasmEncoder {
    #[wasm_bindgen(constructor)]
    pub fn new(mycall: &str, dest: &str, path: &str) -> Result<WasmEncoder, JsValue> {
        let header = Header::ui(
            mycall.parse().map_err(js_error)?,
            dest.parse().map_err(js_error)?,
            parse_path(path).map_err(js_error)?,
        );
        Ok(WasmEncoder {
            arena: Arena::new(&ArenaConfig::default()),
            header,
        })
    }

    /// Encode a UI frame with the given information field
    /// Returns a Float32Array of audio samples
    #[wasm_bindgen]
    pub fn encode(&mut self, info: &str) -> Result<Vec<f32>, JsValue> {
        let mut frame = self.arena.acquire().map_err(js_error)?;
        self.header.encode(&mut frame).map_err(js_error)?;
        frame.put_str(info).map_err(js_error)?;
        Ok(transmit(frame))
    }

    /// Encode raw frame contents (address field included)
    #[wasm_bindgen(js_name = encodeRaw)]
    pub fn encode_raw(&mut self, data: &[u8]) -> Result<Vec<f32>, JsValue> {
        let frame = self.arena.frame_from(data).map_err(js_error)?;
        Ok(transmit(frame))
    }
}

fn transmit(frame: Frame) -> Vec<f32> {
    // Nothing else shares the channel, so no persistence waits
    let access = ChannelAccess {
        persistence: 0,
        ..ChannelAccess::default()
    };
    let mut framer = Framer::new(AfskLoopback::new(), FrameQueue::new(1), access);
    framer.send(frame);
    framer.into_radio().take_samples()
}

#[wasm_bindgen]
pub struct WasmDecoder {
    receiver: Receiver,
    frames: FrameQueue,
}

#[wasm_bindgen]
impl WasmDecoder {
    #[wasm_bindgen(constructor)]
    pub fn new() -> WasmDecoder {
        let arena = Arena::new(&ArenaConfig::default());
        let subscribers = Subscribers::new();
        let frames = FrameQueue::new(QUEUE_SIZE);
        subscribers.subscribe(SUBSCRIBER_MONITOR, Some(frames.clone()));
        WasmDecoder {
            receiver: Receiver::new(arena, subscribers, &DemodConfig::default()),
            frames,
        }
    }

    /// Feed audio samples (9600 Hz). Returns monitor lines for frames
    /// completed by these samples.
    #[wasm_bindgen]
    pub fn decode(&mut self, samples: &[f32]) -> Array {
        let lines = Array::new();
        for chunk in samples.chunks(1024) {
            self.receiver.push_samples(chunk);
            self.collect(&lines);
        }
        lines
    }

    /// Decode whatever is left of the current receive window
    #[wasm_bindgen]
    pub fn finish(&mut self) -> Array {
        let lines = Array::new();
        self.receiver.finish();
        self.collect(&lines);
        lines
    }

    #[wasm_bindgen(js_name = carrierDetected)]
    pub fn carrier_detected(&self) -> bool {
        self.receiver
            .carrier_flag()
            .load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl WasmDecoder {
    fn collect(&self, lines: &Array) {
        while let Some(mut frame) = self.frames.try_get() {
            lines.push(&JsValue::from_str(&render(&mut frame)));
        }
    }
}

impl Default for WasmDecoder {
    fn default() -> Self {
        Self::new()
    }
}
