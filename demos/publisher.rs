//! Example Publisher
//!
//! Creates a frame channel and publishes a moving test pattern at ~30 fps
//! until the process is killed.

use frame_channel::{Channel, FrameShape, Status};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const WIDTH: usize = 320;
const HEIGHT: usize = 240;
const DEPTH: usize = 3;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "demo".to_string());
    let shape = FrameShape::new(WIDTH, HEIGHT, DEPTH, 1);
    let frame_bytes = WIDTH * HEIGHT * DEPTH;

    let channel = match Channel::create_or_open(&name, frame_bytes) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[Publisher] Failed to create channel: {}", e);
            std::process::exit(1);
        }
    };

    println!("[Publisher] Channel '{}' at {}", name, channel.path().display());
    println!("[Publisher] Publishing {}x{}x{} frames (Ctrl+C to quit)", WIDTH, HEIGHT, DEPTH);

    let mut pixels = vec![0u8; frame_bytes];
    let period = Duration::from_millis(33);
    let start = Instant::now();

    for tick in 0u64.. {
        for (i, px) in pixels.iter_mut().enumerate() {
            *px = ((i / DEPTH) as u64 + tick) as u8;
        }

        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        match channel.publish(now_ms, shape, &pixels) {
            Ok(Status::Success) => {}
            Ok(status) => {
                println!("[Publisher] Channel closed ({:?})", status);
                break;
            }
            Err(e) => {
                eprintln!("[Publisher] Publish failed: {}", e);
                std::process::exit(1);
            }
        }

        if tick % 100 == 0 && tick > 0 {
            let elapsed = start.elapsed().as_secs_f64();
            println!("[Publisher] {} frames, {:.1} fps", tick, tick as f64 / elapsed);
        }

        std::thread::sleep(period);
    }
}
