pub mod settings;

pub use settings::{
    generate_default_config, HardwareSettings, HypervisorSettings, ProjectSettings, Settings,
    StorageSettings, TimeoutSettings,
};
