mod defaults;
mod deserialize;
mod resolve;
mod types;

pub use self::defaults::{parse_chrono_duration, parse_human_duration};
pub use self::resolve::{
    CONFIG_ENV_VAR, ConfigSource, default_config_search_paths, load_config,
    minimal_config_template, parse_config, resolve_config_path,
};
pub use self::types::*;
