//! Configuration for Augur.

mod settings;

pub use settings::{
    AgentSettings, GuardSettings, ModelSettings, PolicySettings, Settings, SettingsError,
};
