//! umlautd - system-wide compose-sequence keyboard remapping daemon.

use log::{info, LevelFilter};

use umlaut_engine::config::Config;
use umlaut_engine::die;
use umlaut_engine::event_loop::EventLoop;
use umlaut_engine::paths;

mod cli;
mod logging;

fn main() {
    let options = cli::Options::load();

    let level = if options.debug { LevelFilter::Debug } else { LevelFilter::Info };
    logging::initialize(level).expect("Unable to initialize logger");

    info!("Starting umlaut daemon (debug={})", if options.debug { "ON" } else { "OFF" });

    let config_dir = options.config_dir.clone().unwrap_or_else(paths::config_dir);

    let config = match Config::load(&config_dir) {
        Ok(config) => config,
        Err(err) => die!("{err}"),
    };
    if !options.debug {
        log::set_max_level(config.log_level);
    }

    let mut event_loop = match EventLoop::new(config, config_dir, options.debug) {
        Ok(event_loop) => event_loop,
        Err(err) => die!("{err}"),
    };

    info!("Umlaut daemon ready");

    if let Err(err) = event_loop.run() {
        die!("Event loop error: {err}");
    }

    info!("Goodbye");
}
