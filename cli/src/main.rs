use clap::{Parser, Subcommand};
use hound::WavSpec;
use log::{debug, info};
use packetwave_core::ax25::{format_path, Header};
use packetwave_core::config::{
    ArenaConfig, ChannelAccess, DemodConfig, MemoryParams, RelayConfig, StationConfig,
};
use packetwave_core::hdlc::{AfskLoopback, SUBSCRIBER_MONITOR, SUBSCRIBER_RELAY};
use packetwave_core::heard::HeardList;
use packetwave_core::monitor::render;
use packetwave_core::{
    Arena, Digipeater, Frame, FrameQueue, Framer, Receiver, Subscribers, QUEUE_SIZE, SAMPLE_RATE,
};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use thiserror::Error;

/// Silence between transmissions in generated audio
const GAP_SAMPLES: usize = SAMPLE_RATE / 4;

#[derive(Parser)]
#[command(name = "packetwave")]
#[command(about = "1200 baud AFSK packet radio encoder, decoder and relay")]
struct Cli {
    /// Configuration parameter, e.g. MYCALL=LA7ECA-9 (repeatable)
    #[arg(short, long = "param", value_name = "KEY=VALUE", global = true)]
    params: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode UI frames to a WAV audio file
    Encode {
        /// Output WAV file
        #[arg(value_name = "OUTPUT.WAV")]
        output: PathBuf,

        /// Information field of each frame
        #[arg(value_name = "INFO", required = true)]
        messages: Vec<String>,
    },

    /// Decode frames from a WAV audio file
    Decode {
        /// Input WAV file
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,

        /// Print one JSON object per frame
        #[arg(long)]
        json: bool,
    },

    /// Decode a WAV file and write what a relay would repeat
    Digipeat {
        /// Input WAV file
        #[arg(value_name = "INPUT.WAV")]
        input: PathBuf,

        /// Output WAV file with the repeated frames
        #[arg(value_name = "OUTPUT.WAV")]
        output: PathBuf,
    },
}

#[derive(Error, Debug)]
enum CliError {
    #[error("Unsupported sample rate {0} Hz, expected {SAMPLE_RATE} Hz")]
    SampleRate(u32),

    #[error("Unsupported bit depth: {0}")]
    BitDepth(u16),

    #[error("Nothing to transmit")]
    NothingToSend,
}

#[derive(Serialize)]
struct DecodedFrame {
    source: String,
    destination: String,
    path: Vec<String>,
    info: String,
    length: usize,
}

impl DecodedFrame {
    fn from_frame(frame: &mut Frame) -> Option<Self> {
        let header = Header::decode(frame).ok()?;
        let info = String::from_utf8_lossy(&frame.read_remaining()).into_owned();
        Some(Self {
            source: header.src.to_string(),
            destination: header.dest.to_string(),
            path: header
                .path
                .iter()
                .map(|a| if a.is_relayed() { format!("{}*", a) } else { a.to_string() })
                .collect(),
            info,
            length: frame.len(),
        })
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let cli = Cli::parse();

    let mut params = MemoryParams::new();
    for assignment in &cli.params {
        params.set_assignment(assignment)?;
    }

    match cli.command {
        Commands::Encode { output, messages } => encode_command(&params, &messages, &output)?,
        Commands::Decode { input, json } => decode_command(&params, &input, json)?,
        Commands::Digipeat { input, output } => digipeat_command(&params, &input, &output)?,
    }

    Ok(())
}

fn encode_command(
    params: &MemoryParams,
    messages: &[String],
    output_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let arena = Arena::new(&ArenaConfig::default());
    let station = StationConfig::from_params(params);
    let header = Header::from_station(&station)?;
    println!(
        "Encoding {} frame(s) as {} via {}",
        messages.len(),
        header.src,
        format_path(&header.path, false)
    );

    let queue = FrameQueue::new(QUEUE_SIZE.max(messages.len()));
    for message in messages {
        let mut frame = arena.acquire()?;
        header.encode(&mut frame)?;
        frame.put_str(message)?;
        queue.put(frame)?;
    }

    let samples = transmit_all(params, queue)?;
    write_wav(output_path, &samples)?;
    println!("Wrote {} samples to {}", samples.len(), output_path.display());
    Ok(())
}

fn decode_command(
    params: &MemoryParams,
    input_path: &Path,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let samples = read_wav(input_path)?;
    let arena = Arena::new(&ArenaConfig::default());
    let mut lines = Vec::new();
    let count = receive(params, &arena, &samples, SUBSCRIBER_MONITOR, |mut frame| {
        if !json {
            lines.push(render(&mut frame));
            return;
        }
        match DecodedFrame::from_frame(&mut frame) {
            Some(decoded) => lines.push(serde_json::to_string(&decoded).unwrap_or_default()),
            None => debug!("Skipping frame without address field"),
        }
    });
    for line in lines {
        println!("{}", line);
    }
    info!("Decoded {} frame(s)", count);
    Ok(())
}

fn digipeat_command(
    params: &MemoryParams,
    input_path: &Path,
    output_path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let samples = read_wav(input_path)?;
    let arena = Arena::new(&ArenaConfig::default());
    let station = StationConfig::from_params(params);
    let tx_queue = FrameQueue::new(QUEUE_SIZE);
    let digi = Digipeater::new(
        Arc::clone(&arena),
        station.mycall.parse()?,
        RelayConfig::from_params(params),
        HeardList::default().into_shared(),
        tx_queue.clone(),
    );

    let relay_in = FrameQueue::new(QUEUE_SIZE);
    let heard = receive(params, &arena, &samples, SUBSCRIBER_RELAY, |frame| {
        // Room for the sentinel below
        if relay_in.free_capacity() > 1 && relay_in.try_put(frame).is_ok() {
            return;
        }
        debug!("Relay input full, dropping frame");
    });
    println!("Heard {} frame(s)", heard);
    relay_in.signal()?;
    digi.run(&relay_in, &AtomicBool::new(false));

    let repeated = tx_queue.len();
    println!("Repeating {} frame(s)", repeated);
    if repeated == 0 {
        return Err(CliError::NothingToSend.into());
    }
    let samples = transmit_all(params, tx_queue)?;
    write_wav(output_path, &samples)?;
    println!("Wrote {} samples to {}", samples.len(), output_path.display());
    Ok(())
}

/// Run samples through the receiver with one subscriber at `index`, handing
/// every delivered frame to `on_frame`. Returns the number of frames.
fn receive<F>(
    params: &MemoryParams,
    arena: &Arc<Arena>,
    samples: &[f32],
    index: usize,
    mut on_frame: F,
) -> usize
where
    F: FnMut(Frame),
{
    let subscribers = Subscribers::new();
    let queue = FrameQueue::new(QUEUE_SIZE);
    subscribers.subscribe(index, Some(queue.clone()));
    let mut rx = Receiver::new(Arc::clone(arena), subscribers, &DemodConfig::from_params(params));

    let mut count = 0;
    let mut deliver = |queue: &FrameQueue| {
        while let Some(frame) = queue.try_get() {
            count += 1;
            on_frame(frame);
        }
    };
    for chunk in samples.chunks(1024) {
        rx.push_samples(chunk);
        deliver(&queue);
    }
    rx.finish();
    deliver(&queue);

    let stats = rx.stats();
    debug!(
        "{} windows, {} retried, {} recovered by filters",
        stats.windows, stats.retried, stats.recovered
    );
    count
}

/// Send everything in `queue` through the framer into audio samples
fn transmit_all(params: &MemoryParams, queue: FrameQueue) -> Result<Vec<f32>, CliError> {
    let mut framer = Framer::new(AfskLoopback::new(), queue.clone(), ChannelAccess::from_params(params));
    let mut samples = vec![0.0; GAP_SAMPLES];
    while let Some(frame) = queue.try_get() {
        framer.send(frame);
        samples.extend(framer.radio_mut().take_samples());
        samples.extend(std::iter::repeat(0.0).take(GAP_SAMPLES));
    }
    if framer.radio().transmissions() == 0 {
        return Err(CliError::NothingToSend);
    }
    info!("{} transmission(s)", framer.radio().transmissions());
    Ok(samples)
}

fn write_wav(path: &Path, samples: &[f32]) -> Result<(), Box<dyn std::error::Error>> {
    // 16-bit PCM
    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE as u32,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let file = File::create(path)?;
    let mut writer = hound::WavWriter::new(file, spec)?;
    for &sample in samples {
        let clamped = sample.clamp(-1.0, 1.0);
        writer.write_sample((clamped * 32767.0) as i16)?;
    }
    writer.finalize()?;
    Ok(())
}

fn read_wav(path: &Path) -> Result<Vec<f32>, Box<dyn std::error::Error>> {
    let file = File::open(path)?;
    let mut reader = hound::WavReader::new(file)?;
    let spec = reader.spec();
    debug!(
        "Read WAV: {} Hz, {} channels, {} bits",
        spec.sample_rate, spec.channels, spec.bits_per_sample
    );
    if spec.sample_rate != SAMPLE_RATE as u32 {
        return Err(CliError::SampleRate(spec.sample_rate).into());
    }

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|s| s as f32 / 32768.0))
            .collect::<Result<_, _>>()?,
        (hound::SampleFormat::Float, 32) => reader.samples::<f32>().collect::<Result<_, _>>()?,
        (_, bits) => return Err(CliError::BitDepth(bits).into()),
    };

    // Keep the first channel only
    let channels = spec.channels.max(1) as usize;
    Ok(samples.into_iter().step_by(channels).collect())
}
