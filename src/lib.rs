// Library modules
pub mod config;
pub mod console;
pub mod constants;
pub mod hub;
pub mod inventory;
pub mod ipmi;
pub mod redfish;

// Re-export commonly used types
pub use config::Config;
pub use console::{Analytics, BootEvent, CleanState, LogWriter, ScreenBuffer, ServerAnalytics};
pub use hub::{BroadcastHub, SessionStatus, SessionSupervisor, Subscription};
pub use inventory::{
    HttpInventorySource, InventoryEvent, InventorySource, InventorySync, ServerEntry,
};
pub use ipmi::{SolConfig, SolError, SolTransport};
