//! Example Consumer
//!
//! Opens an existing frame channel and prints what it reads, including how
//! many frames it skipped by falling behind.

use frame_channel::{Channel, Frame, Status};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "demo".to_string());

    let channel = match Channel::open_existing(&name) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[Consumer] Failed to open channel: {}", e);
            eprintln!("[Consumer] Make sure the publisher is running first!");
            std::process::exit(1);
        }
    };

    println!("[Consumer] Attached to '{}' ({} bytes per frame)", name, channel.max_entry_size());

    let mut frame = Frame::new();
    let mut received = 0u64;
    let mut skipped = 0u64;

    loop {
        let last_uid = frame.uid();
        match channel.consume(&mut frame, true) {
            Ok(Status::Success) => {
                received += 1;
                if last_uid > 0 {
                    skipped += frame.uid() - last_uid - 1;
                }
                if received % 30 == 0 {
                    println!(
                        "[Consumer] #{} {}x{}x{} t={} first={} (received {}, skipped {})",
                        frame.uid(),
                        frame.width(),
                        frame.height(),
                        frame.depth(),
                        frame.acquisition_time(),
                        frame.data().first().copied().unwrap_or(0),
                        received,
                        skipped
                    );
                }
            }
            Ok(Status::NoNewFrame) => println!("[Consumer] No frame within timeout"),
            Ok(Status::Deleted) => {
                println!("[Consumer] Publisher closed the channel");
                break;
            }
            Err(e) => {
                eprintln!("[Consumer] Read failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}
