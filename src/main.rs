use std::{
    error::Error,
    fs::File,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::Utc;
use clap::Parser;
use env_logger::{Env, Target};
use log::info;

use flow_dash::{
    backend::Backend,
    config::load_config,
    store::JsonFileStore,
    ui,
    worker::Worker,
    App, CacheManager, CliArgs, SharedCache,
};

fn main() -> Result<(), Box<dyn Error>> {
    let cli_args = CliArgs::parse();
    let config = load_config(&cli_args)?;

    // The terminal belongs to the UI, so logs go to a file.
    let log_file = File::create(&config.log_file)?;
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(Target::Pipe(Box::new(log_file)))
        .init();

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || shutdown_flag.store(true, Ordering::SeqCst))?;

    let store = JsonFileStore::open(&config.cache.path, config.cache.quota_bytes)?;
    let cache = SharedCache::new(CacheManager::new(store, config.cache.prefix.clone(), config.default_ttl()));
    let backend = Arc::new(Backend::new(config.request_timeout())?);

    let params = config.query_params(Utc::now())?;
    info!(
        "Dashboard for exporter {} interface {} from {} to {}",
        params.exporter, params.interface, params.start, params.end
    );

    let mut app = App::new(
        params,
        config.default_ttl(),
        config.selection_tolerance,
        backend,
        cache,
        Worker::spawn(),
    );
    app.init_default_charts(config.use_api);

    ui::run(app, shutdown)?;
    info!("Shutting down");
    Ok(())
}
