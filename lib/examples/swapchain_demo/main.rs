use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use swapr::{
    dispatch::{ActionQueue, Multiplexer, ReactorThread},
    report,
    swapchain::{BufferQueue, BufferQueueError, QueueConfig, SwapDepth},
    BufferProperties, BufferUsage, PixelFormat, Size,
};
use swapr_utils::{framegen::FrameGenerator, shm_allocator::ShmAllocator};

use anyhow::{anyhow, Context};
use clap::{Arg, Command};
use log::{debug, warn};

type Queue = BufferQueue<ShmAllocator>;

fn parse_size(s: &str) -> anyhow::Result<Size> {
    const ERROR_MSG: &str = "Invalid parameter for frame_size";
    let split: Vec<&str> = s.split('x').collect();
    if split.len() != 2 {
        return Err(anyhow!(ERROR_MSG));
    }
    let width = split[0].parse().context(ERROR_MSG)?;
    let height = split[1].parse().context(ERROR_MSG)?;

    Ok(Size::new(width, height))
}

fn rate_to_period(rate: &str) -> anyhow::Result<Duration> {
    let rate: u32 = rate.parse().context("Invalid rate")?;
    if rate == 0 {
        return Err(anyhow!("Rate must be non-zero"));
    }

    Ok(Duration::from_secs(1) / rate)
}

/// Compositor side of the demo, only ever used from the reactor thread.
struct Compositor {
    queue: Arc<Queue>,
    frame: Mutex<Vec<u8>>,
    composited: AtomicU64,
    last_frame: AtomicU64,
}

impl Compositor {
    fn composite(&self) -> anyhow::Result<()> {
        let buffer = match self.queue.compositor_acquire() {
            Ok(Some(buffer)) => buffer,
            // Keep displaying the previous frame.
            Ok(None) => return Ok(()),
            Err(BufferQueueError::Shutdown) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut frame = self
            .frame
            .lock()
            .map_err(|_| anyhow!("Frame buffer poisoned"))?;
        buffer.handle().read_frame(&mut frame)?;
        self.last_frame.store(buffer.frame_number(), Ordering::SeqCst);
        self.composited.fetch_add(1, Ordering::SeqCst);
        debug!(
            "Composited frame {} from buffer {}",
            buffer.frame_number(),
            buffer.id()
        );

        self.queue
            .compositor_release(buffer)
            .map_err(|e| anyhow!("Failed to release buffer: {}", e))
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = Command::new("Swapchain demo")
        .arg(
            Arg::new("num_frames")
                .long("frames")
                .takes_value(true)
                .default_value("300")
                .help("Number of frames to render"),
        )
        .arg(
            Arg::new("depth")
                .long("depth")
                .takes_value(true)
                .help("Number of buffers to use (2 or 3, defaults to SWAPR_NBUFFERS)"),
        )
        .arg(
            Arg::new("frame_size")
                .long("frame_size")
                .takes_value(true)
                .default_value("320x240")
                .help("Size of the frames to render (e.g. \"640x480\")"),
        )
        .arg(
            Arg::new("client_rate")
                .long("client_rate")
                .takes_value(true)
                .default_value("120")
                .help("Frames per second rendered by the client"),
        )
        .arg(
            Arg::new("refresh_rate")
                .long("refresh_rate")
                .takes_value(true)
                .default_value("60")
                .help("Frames per second displayed by the compositor"),
        )
        .get_matches();

    let num_frames: u64 = matches
        .value_of("num_frames")
        .unwrap_or("300")
        .parse()
        .context("Invalid number of frames")?;
    let frame_size = parse_size(matches.value_of("frame_size").unwrap_or("320x240"))?;
    let client_period = rate_to_period(matches.value_of("client_rate").unwrap_or("120"))?;
    let refresh_period = rate_to_period(matches.value_of("refresh_rate").unwrap_or("60"))?;

    let properties = BufferProperties::new(frame_size, PixelFormat::XRGB8888, BufferUsage::Software);
    let report = report::from_env();
    let mut config = QueueConfig::from_env(properties).report(Arc::clone(&report));
    if let Some(depth) = matches.value_of("depth") {
        let depth: u32 = depth.parse().context("Invalid depth")?;
        config = config.depth(SwapDepth::try_from(depth)?);
    }

    let lets_quit = Arc::new(AtomicBool::new(false));
    // Setup the Ctrl+c handler.
    {
        let lets_quit_handler = lets_quit.clone();
        ctrlc::set_handler(move || {
            lets_quit_handler.store(true, Ordering::SeqCst);
        })
        .context("Failed to set Ctrl-C handler")?;
    }

    let queue = Arc::new(BufferQueue::new(config, ShmAllocator::new())?);
    println!(
        "Rendering {} frames of {} {} into {} buffers",
        num_frames,
        properties.size,
        properties.format,
        queue.depth().num_buffers()
    );

    let multiplexer = Arc::new(Multiplexer::with_report(Arc::clone(&report))?);
    let actions = Arc::new(ActionQueue::with_report(Arc::clone(&report))?);
    multiplexer.register(actions.clone())?;
    let reactor = ReactorThread::spawn(Arc::clone(&multiplexer))?;

    let compositor = Arc::new(Compositor {
        queue: Arc::clone(&queue),
        frame: Mutex::new(vec![0u8; properties.frame_size().unwrap_or(0)]),
        composited: AtomicU64::new(0),
        last_frame: AtomicU64::new(0),
    });

    // Vsync: ask the reactor thread to composite at every refresh.
    let vsync_quit = Arc::new(AtomicBool::new(false));
    let vsync = {
        let compositor = Arc::clone(&compositor);
        let actions = Arc::clone(&actions);
        let vsync_quit = Arc::clone(&vsync_quit);
        thread::Builder::new()
            .name("vsync".into())
            .spawn(move || -> io::Result<()> {
                while !vsync_quit.load(Ordering::SeqCst) {
                    thread::sleep(refresh_period);
                    let compositor = Arc::clone(&compositor);
                    actions.enqueue(move || compositor.composite())?;
                }
                Ok(())
            })?
    };

    // Client: render frames as fast as the queue and the client rate allow.
    let producer = {
        let queue = Arc::clone(&queue);
        let lets_quit = Arc::clone(&lets_quit);
        thread::Builder::new()
            .name("client".into())
            .spawn(move || -> anyhow::Result<u64> {
                let mut generator = FrameGenerator::new(&properties)?;
                let mut frame = vec![0u8; generator.frame_size()];
                let mut rendered = 0;

                while rendered < num_frames && !lets_quit.load(Ordering::SeqCst) {
                    let buffer = match queue.client_acquire(Some(Duration::from_secs(1))) {
                        Ok(buffer) => buffer,
                        Err(BufferQueueError::Exhausted) => {
                            warn!("Compositor is not releasing buffers");
                            continue;
                        }
                        Err(BufferQueueError::Shutdown) => break,
                        Err(e) => return Err(e.into()),
                    };

                    generator.next_frame(&mut frame)?;
                    buffer.handle().write_frame(&frame)?;
                    queue
                        .client_submit(buffer)
                        .map_err(|e| anyhow!("Failed to submit buffer: {}", e))?;
                    rendered += 1;

                    print!("\rRendered frame {:#5}", rendered);
                    io::stdout().flush()?;
                    thread::sleep(client_period);
                }

                Ok(rendered)
            })?
    };

    let start_time = Instant::now();
    let rendered = producer
        .join()
        .map_err(|_| anyhow!("Client thread panicked"))??;
    let elapsed = start_time.elapsed();
    println!();

    // Let the compositor pick up the last frame before tearing down.
    thread::sleep(refresh_period * 2);
    vsync_quit.store(true, Ordering::SeqCst);
    vsync
        .join()
        .map_err(|_| anyhow!("Vsync thread panicked"))??;
    reactor.stop();
    queue.shutdown();

    let stats = queue.stats();
    println!(
        "Rendered {} frames in {:.2}s ({:.2} fps)",
        rendered,
        elapsed.as_secs_f32(),
        rendered as f32 / elapsed.as_secs_f32()
    );
    println!(
        "Submitted: {}, composited: {}, dropped: {}, last frame displayed: {}",
        stats.num_submitted(),
        compositor.composited.load(Ordering::SeqCst),
        stats.num_dropped(),
        compositor.last_frame.load(Ordering::SeqCst)
    );

    Ok(())
}
