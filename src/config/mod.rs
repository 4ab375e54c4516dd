//! Engine configuration: TOML file, `SCAM_*` env overrides, sanitisation.

pub mod engine;

pub use engine::{
    EngineConfig, LifecycleSection, LimitsSection, DEFAULT_CONFIG_PATH, ENV_CONFIG_PATH,
};
