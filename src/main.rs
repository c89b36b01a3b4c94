use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use tracing::{info, warn};

use drift_dhcpv6::addrdb::AddrDb;
use drift_dhcpv6::config::Config;
use drift_dhcpv6::{logging, signal, v6};

fn main() {
    let config_dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    let config = match Config::load_from_files(&config_dir) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    logging::init(config.log_level);
    info!(
        duid = %config.server_duid,
        dns = ?config.dns_servers,
        ddns = ?config.ddns_protocol,
        "server identity and DNS policy loaded"
    );

    let mut db = AddrDb::new(config.db_path.clone());
    match db.load() {
        Ok(true) => info!(path = %db.db_path().display(), "lease database restored"),
        Ok(false) => warn!(path = %db.db_path().display(), "lease database held no usable clients"),
        Err(e) => warn!(%e, "starting with an empty lease database"),
    }

    let db = Arc::new(RwLock::new(db));
    let config = Arc::new(ArcSwap::from_pointee(config));

    signal::spawn_sighup_handler(config.clone(), db.clone(), config_dir);
    v6::v6_worker(config, db);
}
