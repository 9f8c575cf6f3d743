//! Runs the receive pipeline against a synthetic producer.
//!
//! The producer arena is created as a POSIX shared-memory object (or on the
//! heap with `--heap`), filled by [`SyntheticProducer`] at a fixed slot rate,
//! and drained by the pipeline into an endpoint that completes every transfer
//! immediately. The final metrics are printed as JSON on stdout.
//!
//! # Usage
//!
//! ```sh
//! iqstream-sim --seconds 5 --rate 240000 --drop-every 10000
//! ```

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use iqstream::ipc::shmem::{Creator, Opener, Shm, ShmError};
use iqstream::ring::{DmaRegion, RING_SLOTS};
use iqstream::sim::SyntheticProducer;
use iqstream::transport::SubmitError;
use iqstream::{
    BulkEndpoint, FenceOnly, MetricsSnapshot, Pipeline, PipelineConfig, PipelineError, Placement,
    PollCadence, RequestHandle, TransferStatus,
};
use minstant::Instant;

/// Default shared-memory object name.
const DEFAULT_SHM: &str = "/iqstream-sim";

/// Four channels at 61.44 Msps, 256 samples per slot.
const DEFAULT_RATE: u64 = 4 * 240_000;

const DEFAULT_SECONDS: u64 = 2;

/// How often the transport side drains the queue.
const PUMP_INTERVAL: Duration = Duration::from_micros(500);

#[derive(Debug, thiserror::Error)]
enum SimError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("failed to read config `{path}`: {source}")]
    ConfigFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    ConfigFormat(#[from] serde_json::Error),
    #[error("failed to spawn producer: {0}")]
    Producer(#[source] std::io::Error),
}

impl From<ShmError> for SimError {
    fn from(err: ShmError) -> Self {
        Self::Pipeline(PipelineError::Shm(err))
    }
}

struct Args {
    shm: String,
    heap: bool,
    seconds: u64,
    rate: u64,
    drop_every: u64,
    config: PipelineConfig,
}

fn main() {
    iqstream::init_tracing();
    if let Err(e) = run() {
        eprintln!("iqstream-sim: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), SimError> {
    let args: Vec<String> = std::env::args().collect();
    let args = parse_args(&args)?;

    let snapshot = if args.heap {
        let region = DmaRegion::<RING_SLOTS>::new_shared().map_err(PipelineError::from)?;
        stream(Arc::clone(&region), region, &args)?
    } else {
        let producer_side = Shm::<DmaRegion<RING_SLOTS>, Creator>::create(&args.shm)?;
        let consumer_side = Shm::<DmaRegion<RING_SLOTS>, Opener>::open(&args.shm)?;
        stream(producer_side, consumer_side, &args)?
    };

    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn stream<P, C>(producer_side: P, consumer_side: C, args: &Args) -> Result<MetricsSnapshot, SimError>
where
    P: Deref<Target = DmaRegion<RING_SLOTS>> + Send + 'static,
    C: Deref<Target = DmaRegion<RING_SLOTS>> + Send + 'static,
{
    eprintln!(
        "iqstream-sim: {} slots/s for {}s over {}",
        args.rate,
        args.seconds,
        if args.heap { "heap" } else { args.shm.as_str() }
    );

    let pipeline = Pipeline::spawn(consumer_side, args.config.clone(), FenceOnly)?;
    let mut transport = pipeline.transport(LoopbackEndpoint::default());

    let stop_producer = Arc::new(AtomicBool::new(false));
    let producer = SyntheticProducer::new(producer_side, args.config.channels as u32)
        .with_drop_every(args.drop_every)
        .spawn(args.rate, Arc::clone(&stop_producer))
        .map_err(SimError::Producer)?;

    let deadline = Duration::from_secs(args.seconds);
    let start = Instant::now();
    while start.elapsed() < deadline {
        transport.pump();
        complete_all(&mut transport);
        thread::sleep(PUMP_INTERVAL);
    }

    stop_producer.store(true, Ordering::Relaxed);
    let produced = producer.join().unwrap_or(0);
    transport.pump();
    complete_all(&mut transport);

    let snapshot = pipeline.snapshot();
    pipeline.shutdown();

    eprintln!(
        "iqstream-sim: produced {produced} slots, sent {} bytes in {} transfers",
        transport.endpoint().bytes,
        transport.endpoint().transfers
    );
    Ok(snapshot)
}

fn complete_all(transport: &mut iqstream::TransportPump<LoopbackEndpoint>) {
    let done = std::mem::take(&mut transport.endpoint_mut().queued);
    for handle in done {
        transport.on_complete(handle, TransferStatus::Ok);
    }
}

/// Accepts every transfer and reports it done on the next drain.
#[derive(Default)]
struct LoopbackEndpoint {
    queued: Vec<RequestHandle>,
    bytes: u64,
    transfers: u64,
}

impl BulkEndpoint for LoopbackEndpoint {
    fn submit(
        &mut self,
        handle: RequestHandle,
        header: &[u8],
        payload: &[u8],
    ) -> Result<(), SubmitError> {
        self.bytes += (header.len() + payload.len()) as u64;
        self.transfers += 1;
        self.queued.push(handle);
        Ok(())
    }
}

fn value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str, SimError> {
    args.get(i)
        .map(String::as_str)
        .ok_or_else(|| SimError::Usage(format!("missing value for {flag}")))
}

fn number(args: &[String], i: usize, flag: &str) -> Result<u64, SimError> {
    value(args, i, flag)?
        .parse()
        .map_err(|e| SimError::Usage(format!("invalid value for {flag}: {e}")))
}

/// Parses the command line. `--pin` and `--spin` override the matching
/// fields of a `--config` file wherever they appear.
fn parse_args(args: &[String]) -> Result<Args, SimError> {
    let mut parsed = Args {
        shm: DEFAULT_SHM.to_string(),
        heap: false,
        seconds: DEFAULT_SECONDS,
        rate: DEFAULT_RATE,
        drop_every: 0,
        config: PipelineConfig {
            cadence: PollCadence::Interval(Duration::from_micros(200)),
            ..PipelineConfig::default()
        },
    };
    let mut config_path = None;
    let mut placement = None;
    let mut spin = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--shm" | "-s" => {
                i += 1;
                parsed.shm = value(args, i, "--shm")?.to_string();
            }
            "--heap" => parsed.heap = true,
            "--seconds" | "-t" => {
                i += 1;
                parsed.seconds = number(args, i, "--seconds")?;
            }
            "--rate" | "-r" => {
                i += 1;
                parsed.rate = number(args, i, "--rate")?;
            }
            "--drop-every" | "-d" => {
                i += 1;
                parsed.drop_every = number(args, i, "--drop-every")?;
            }
            "--pin" | "-p" => {
                i += 1;
                placement = Some(match value(args, i, "--pin")? {
                    "auto" => Placement::Auto,
                    core => Placement::Core(
                        core.parse()
                            .map_err(|e| SimError::Usage(format!("invalid value for --pin: {e}")))?,
                    ),
                });
            }
            "--spin" => spin = true,
            "--config" | "-c" => {
                i += 1;
                config_path = Some(value(args, i, "--config")?);
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(SimError::Usage(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    if let Some(path) = config_path {
        let text = std::fs::read_to_string(path).map_err(|source| SimError::ConfigFile {
            path: path.to_string(),
            source,
        })?;
        parsed.config = serde_json::from_str(&text)?;
    }
    if let Some(placement) = placement {
        parsed.config.placement = placement;
    }
    if spin {
        parsed.config.cadence = PollCadence::Spin;
    }

    Ok(parsed)
}

fn print_usage() {
    eprintln!(
        r#"iqstream-sim - run the receive pipeline against a synthetic producer

USAGE:
    iqstream-sim [OPTIONS]

OPTIONS:
    -s, --shm <NAME>          Shared-memory object for the arena (default: /iqstream-sim)
        --heap                Keep the arena on the heap instead
    -t, --seconds <N>         Run time (default: 2)
    -r, --rate <SLOTS>        Producer slots per second (default: 960000)
    -d, --drop-every <K>      Skip a sequence number every K slots (default: off)
    -p, --pin <CORE|auto>     Pin the poll thread
        --spin                Yield between passes instead of parking
    -c, --config <PATH>       Pipeline configuration as JSON; --pin and --spin take precedence
    -h, --help                Print this help message

EXAMPLE:
    iqstream-sim --heap --seconds 5 --drop-every 10000
"#
    );
}
