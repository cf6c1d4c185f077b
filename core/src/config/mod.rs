mod load;
mod types;

pub use load::{get_seqflow_data_dir, load_default};
pub use types::{AppConfig, FetchConfig, LoggingConfig, ProcessConfig, SchedulerConfig};
