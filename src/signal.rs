use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use signal_hook::consts::SIGHUP;
use signal_hook::iterator::Signals;
use tracing::{error, info};

use crate::addrdb::{self, AddrDb};
use crate::config::Config;

/// Spawn a thread that handles SIGHUP by reloading the configuration and
/// dumping the lease database to disk
pub fn spawn_sighup_handler(
    config: Arc<ArcSwap<Config>>,
    db: Arc<RwLock<AddrDb>>,
    config_dir: PathBuf,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("sighup".to_string())
        .spawn(move || {
            let mut signals = Signals::new([SIGHUP]).expect("Failed to register SIGHUP handler");

            for sig in signals.forever() {
                if sig == SIGHUP {
                    info!("received SIGHUP, reloading config and dumping lease database");
                    match Config::load_from_files(&config_dir) {
                        Ok(new_config) => {
                            config.store(Arc::new(new_config));
                            info!("configuration reloaded");
                        }
                        Err(e) => error!(%e, "config reload failed, keeping previous config"),
                    }
                    match addrdb::dump_locked(&db) {
                        Ok(()) => info!("lease database dumped"),
                        Err(e) => error!(%e, "lease database dump failed"),
                    }
                }
            }
        })
        .expect("Failed to spawn SIGHUP handler thread")
}
