//! Console byte processing: cleaning, persistence, catchup and analytics.

pub mod analytics;
pub mod clean;
pub mod log_writer;
pub mod screen;

pub use analytics::{Analytics, BootEvent, ServerAnalytics};
pub use clean::CleanState;
pub use log_writer::LogWriter;
pub use screen::ScreenBuffer;
