pub mod app;
pub mod backend;
pub mod cache;
pub mod charts;
pub mod config;
pub mod constants;
pub mod error;
pub mod pipeline;
pub mod rate;
pub mod selection;
pub mod store;
pub mod ui;
pub mod util;
pub mod worker;

pub use app::App;
pub use cache::{CacheManager, SharedCache};
pub use config::{CliArgs, Config};
pub use selection::Selection;
