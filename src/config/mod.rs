pub mod schema;

pub use schema::{
    Config, EngineConfig, GatewayConfig, IssuanceConfig, IssuanceMode, RegistryConfig,
    SourceConfig,
};
