//! uartsensed - daemon that attaches the engine to a serial port

use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use uartsense::protocol::BAUD_MIN;
use uartsense::{
    Config, LogPublisher, Phase, Result, SensorPort, SerialTransport, ThreadScheduler,
};

fn main() -> Result<()> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("uartsensed v0.3.0 starting...");

    // Get config path from args or default
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/uartsense.toml".to_string());

    log::info!("Using config: {}", config_path);
    let config = Config::load(&config_path)?;

    // A fresh sensor always handshakes at the minimum speed
    let transport = SerialTransport::open(&config.port.device, BAUD_MIN)?;

    let mut port = SensorPort::attach(
        Box::new(transport),
        Arc::new(ThreadScheduler::new()),
        Arc::new(LogPublisher::new()),
    )?;
    port.start(Duration::from_millis(config.port.poll_interval_ms))?;

    // Set up shutdown signal handler
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    })
    .map_err(|e| uartsense::Error::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    log::info!("uartsensed running. Press Ctrl-C to stop.");

    let sample_interval = Duration::from_millis(config.daemon.sample_interval_ms);
    while running.load(Ordering::Relaxed) {
        thread::sleep(sample_interval);
        if port.phase() != Phase::Running {
            continue;
        }

        let mode = port.mode();
        let mut values = Vec::new();
        for index in 0..port.data_sets() as usize {
            match port.read_value(index) {
                Ok(value) => values.push(value),
                Err(_) => break,
            }
        }
        log::info!(
            "type {} mode {} ({}): {:?} {}",
            port.type_id(),
            mode,
            port.mode_name(mode).unwrap_or_default(),
            values,
            port.units()
        );
    }

    port.detach()?;
    log::info!("uartsensed stopped");
    Ok(())
}
