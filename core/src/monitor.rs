//! Monitor consumer: renders received frames as text lines

use crate::arena::Frame;
use crate::ax25::display_frame;
use crate::error::TncError;
use crate::queue::FrameQueue;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Monitor line for one frame. Frames without a valid address field are
/// shown as hex.
pub fn render(frame: &mut Frame) -> String {
    match display_frame(frame) {
        Ok(line) => line,
        Err(_) => {
            let hex: Vec<String> = frame.to_vec().iter().map(|b| format!("{:02X}", b)).collect();
            format!("<{}> {}", frame.len(), hex.join(" "))
        }
    }
}

/// Render frames from `input` into `sink` until a sentinel arrives or
/// `shutdown` is set. Returns the number of frames rendered.
pub fn run_monitor<F>(input: &FrameQueue, shutdown: &AtomicBool, mut sink: F) -> usize
where
    F: FnMut(String),
{
    let mut count = 0;
    while !shutdown.load(Ordering::Relaxed) {
        let mut frame = match input.get_timeout(POLL_INTERVAL) {
            Ok(frame) => frame,
            Err(TncError::Timeout) => continue,
            Err(e) => {
                warn!("Monitor input failed: {}", e);
                break;
            }
        };
        if frame.is_empty() {
            debug!("Monitor got sentinel");
            break;
        }
        sink(render(&mut frame));
        count += 1;
    }
    count
}

pub fn spawn_monitor<F>(input: FrameQueue, shutdown: Arc<AtomicBool>, sink: F) -> JoinHandle<usize>
where
    F: FnMut(String) + Send + 'static,
{
    thread::spawn(move || run_monitor(&input, &shutdown, sink))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::ax25::{parse_path, Header};
    use crossbeam_channel::unbounded;

    fn ui_frame(arena: &Arc<Arena>, info: &str) -> Frame {
        let header = Header::ui(
            "LA7ECA".parse().unwrap(),
            "APAR40".parse().unwrap(),
            parse_path("WIDE1-1").unwrap(),
        );
        let mut frame = arena.acquire().unwrap();
        header.encode(&mut frame).unwrap();
        frame.put_str(info).unwrap();
        frame
    }

    #[test]
    fn test_render_garbage_as_hex() {
        let arena = Arena::with_capacity(4, 32);
        let mut frame = arena.frame_from(&[0x01, 0xAB]).unwrap();
        assert_eq!(render(&mut frame), "<2> 01 AB");
    }

    #[test]
    fn test_stops_on_sentinel() {
        let arena = Arena::with_capacity(16, 32);
        let input = FrameQueue::new(4);
        input.put(ui_frame(&arena, ">one")).unwrap();
        input.put(ui_frame(&arena, ">two")).unwrap();
        input.signal().unwrap();

        let mut lines = Vec::new();
        let n = run_monitor(&input, &AtomicBool::new(false), |l| lines.push(l));
        assert_eq!(n, 2);
        assert_eq!(lines, vec!["LA7ECA>APAR40,WIDE1-1:>one", "LA7ECA>APAR40,WIDE1-1:>two"]);
        assert_eq!(arena.used_slots(), 0);
    }

    #[test]
    fn test_spawned_monitor_shutdown() {
        let arena = Arena::with_capacity(16, 32);
        let input = FrameQueue::new(4);
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = unbounded();
        let handle = spawn_monitor(input.clone(), Arc::clone(&shutdown), move |l| {
            let _ = tx.send(l);
        });
        input.put(ui_frame(&arena, ">live")).unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            "LA7ECA>APAR40,WIDE1-1:>live"
        );
        shutdown.store(true, Ordering::Relaxed);
        assert_eq!(handle.join().unwrap(), 1);
    }
}
