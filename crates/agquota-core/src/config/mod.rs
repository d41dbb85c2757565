mod settings;

pub use settings::{
    CacheCommand, CacheSettings, Command, Config, DashboardSettings, DiscoverySettings,
    DisplayFormat, Settings, StatusSettings, SystemSettings,
};
