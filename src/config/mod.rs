pub mod schema;

pub use schema::{
    config_dir, AccountConfig, Config, DmPolicy, GatewayConfig, MediaConfig, PipelineConfig,
};
