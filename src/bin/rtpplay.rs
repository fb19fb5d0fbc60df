// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! rtpplay: receive an H.264 stream over UDP and play it back zero-copy
//! through the hardware decoder and the DRM display.
//!
//! Each received datagram is treated as one complete access unit; RTP
//! depayloading and reassembly are the job of the upstream sender or an
//! external depayloader, matching the receiver contract of the library.

use std::io::Read;
use std::net::UdpSocket;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use argh::FromArgs;

use dmabuf_player::pipeline::PipelineConfig;
use dmabuf_player::player::AccessUnit;
use dmabuf_player::player::PlaybackLoop;

/// Largest datagram we accept; matches the decoder's input plane size.
const MAX_ACCESS_UNIT: usize = 2 * 1024 * 1024;

/// 90 kHz RTP clock at 30 fps.
const TIMESTAMP_STEP: u32 = 3000;

/// Real-time H.264 player: UDP in, hardware decode, DRM scan-out.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the V4L2 decoder device (default: /dev/video10)
    #[argh(option, short = 'd', default = "PathBuf::from(\"/dev/video10\")")]
    device: PathBuf,

    /// local address to listen on (default: 0.0.0.0)
    #[argh(option, short = 'i', default = "String::from(\"0.0.0.0\")")]
    ip: String,

    /// local UDP port to listen on (default: 5600)
    #[argh(option, short = 'p', default = "5600")]
    port: u16,
}

fn main() {
    env_logger::init();
    let args: Args = argh::from_env();

    if let Err(e) = run(args) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    log::info!("decoder device: {}", args.device.display());
    log::info!("listening on {}:{}", args.ip, args.port);

    let config = PipelineConfig { device_path: args.device, ..Default::default() };
    let mut player =
        PlaybackLoop::start(config).context("failed to initialize the decode pipeline")?;
    let handle = player.handle();

    let socket = UdpSocket::bind((args.ip.as_str(), args.port))
        .with_context(|| format!("cannot bind {}:{}", args.ip, args.port))?;
    socket
        .set_read_timeout(Some(Duration::from_millis(500)))
        .context("cannot set socket timeout")?;

    let running = Arc::new(AtomicBool::new(true));
    let receiver_running = running.clone();
    let receiver = std::thread::Builder::new()
        .name("receiver".to_string())
        .spawn(move || {
            let mut buffer = vec![0u8; MAX_ACCESS_UNIT];
            let mut timestamp = 0u32;
            while receiver_running.load(Ordering::Acquire) {
                match socket.recv(&mut buffer) {
                    Ok(len) if len > 0 => {
                        handle.push(AccessUnit {
                            data: buffer[..len].to_vec(),
                            timestamp,
                        });
                        timestamp = timestamp.wrapping_add(TIMESTAMP_STEP);
                    }
                    Ok(_) => {}
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut => {}
                    Err(e) => {
                        log::warn!("receive failed: {}", e);
                        break;
                    }
                }
            }
        })
        .context("failed to spawn receiver thread")?;

    println!("Playing. Press Enter to stop.");
    let _ = std::io::stdin().read(&mut [0u8; 8]);

    running.store(false, Ordering::Release);
    let _ = receiver.join();
    player.stop();

    log::info!(
        "session finished: {} frames decoded, {} dropped on the queue",
        player.decoded_frames(),
        player.frames_dropped()
    );
    Ok(())
}
