//! Binary entry point: wires up logging and configuration, then hands
//! control to an [`lio_core::Engine`]. Feeding the engine from a real
//! LiDAR/IMU driver and publishing its outputs are the embedding
//! application's job (see `SPEC_FULL.md` section 1, Non-goals).

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lio_core::config::EngineConfig;
use lio_core::Engine;

fn main() {
    env_logger::init();

    let config_path = std::env::args().nth(1);
    let config = match config_path {
        Some(path) => match EngineConfig::from_yaml_file(&path) {
            Ok(cfg) => cfg,
            Err(e) => {
                log::error!("failed to load config from {}: {}", path, e);
                EngineConfig::default()
            }
        },
        None => {
            log::info!("no config path given, using defaults");
            EngineConfig::default()
        }
    };
    let map_save_path = config.map_save_path.clone();

    let (mut engine, handle) = Engine::new(config);
    let exit_handle = handle.clone();
    install_sigint_handler(move || exit_handle.request_exit());

    log::info!("engine starting; waiting for synchronized lidar/imu packages");
    engine.run();
    log::info!("engine stopped");

    if let Some(path) = map_save_path {
        if let Err(e) = engine.save_map(&path) {
            log::error!("failed to save map to {}: {}", path, e);
        } else {
            log::info!("map saved to {}", path);
        }
    }
}

static SIGINT_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signum: libc::c_int) {
    SIGINT_RECEIVED.store(true, Ordering::SeqCst);
}

/// Installs a SIGINT handler via `libc::signal` and spawns a watcher
/// thread that calls `on_exit` once the signal fires. A plain `extern
/// "C"` handler can only touch process-wide statics, so the handler
/// itself just flips `SIGINT_RECEIVED`; the watcher thread is what
/// actually reaches into the engine through `EngineHandle`.
fn install_sigint_handler(on_exit: impl Fn() + Send + 'static) {
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
    std::thread::spawn(move || loop {
        if SIGINT_RECEIVED.load(Ordering::SeqCst) {
            on_exit();
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    });
}
