use std::io::{self, BufRead};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use imu_ws_bridge::tracking::{CameraRig, TestMessage, Tracker, TrackingSettings};
use imu_ws_bridge::{delivery_queue, Delivery, Server, ServerConfig};

const DEFAULT_CAMERA: &str = "Camera";

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // A missing .env file is fine, everything has a default.
    if let Err(e) = dotenv::dotenv() {
        log::debug!("no .env loaded: {}", e);
    }

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("bad configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let (queue, mut deliveries) = delivery_queue(config.delivery_capacity);
    let mut server = match Server::start(config, queue) {
        Ok(server) => server,
        Err(e) => {
            log::error!("failed to start server: {}", e);
            return ExitCode::FAILURE;
        }
    };
    log::info!("waiting for IMU clients on ws://{}", server.local_addr());

    let mut rig = CameraRig::new();
    rig.add_camera(DEFAULT_CAMERA);
    let settings = TrackingSettings {
        target_camera: Some(DEFAULT_CAMERA.to_string()),
        ..TrackingSettings::default()
    };
    let mut tracker = Tracker::new(settings, rig);

    let quit = Arc::new(AtomicBool::new(false));
    {
        let quit = Arc::clone(&quit);
        let spawned = thread::Builder::new()
            .name("stdin".into())
            .spawn(move || watch_stdin(io::stdin().lock(), &quit));
        if let Err(e) = spawned {
            log::warn!("cannot watch stdin, stop the process to quit: {}", e);
        }
    }
    log::info!("type 'quit' or close stdin to stop");

    // Application thread: drain the hand-off queue on our own schedule.
    while !deliveries.is_closed() && !quit.load(Ordering::Relaxed) {
        for delivery in deliveries.drain() {
            let greet = match &delivery {
                Delivery::Connected { id, .. } => Some(*id),
                _ => None,
            };

            for camera in tracker.handle(delivery) {
                if let Some(pose) = tracker.rig.pose(&camera) {
                    log::info!(
                        "camera '{}' rotation {:?} location {:?}",
                        camera,
                        pose.rotation,
                        pose.location
                    );
                }
            }

            if let Some(id) = greet {
                log::info!("{}", tracker.status.status);
                match TestMessage::new("Hello from Blender!", SystemTime::now()).to_json() {
                    Ok(json) => {
                        if !server.send_to(id, &json) {
                            log::warn!("{} left before the greeting was sent", id);
                        }
                    }
                    Err(e) => log::warn!("cannot encode greeting: {}", e),
                }
            }
        }
        thread::sleep(Duration::from_millis(1));
    }

    server.stop();
    tracker.server_stopped();
    log::info!("{}", tracker.status.status);
    ExitCode::SUCCESS
}

/// Raises `quit` on EOF, a read error, or a `quit`/`stop` line.
fn watch_stdin<R: BufRead>(input: R, quit: &AtomicBool) {
    for line in input.lines() {
        match line {
            Ok(line) if matches!(line.trim(), "quit" | "stop" | "q") => break,
            Ok(_) => {}
            Err(e) => {
                log::warn!("stdin read failed: {}", e);
                break;
            }
        }
    }
    quit.store(true, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn quit_line_or_eof_raises_flag() {
        let quit = AtomicBool::new(false);
        watch_stdin(Cursor::new("hello\n  quit \nnever read\n"), &quit);
        assert!(quit.load(Ordering::Relaxed));

        let quit = AtomicBool::new(false);
        watch_stdin(Cursor::new(""), &quit);
        assert!(quit.load(Ordering::Relaxed));
    }
}
