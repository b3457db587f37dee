//! Built-in Google tool sets, registered into a [`ToolRegistry`](crate::tool::ToolRegistry).
//!
//! - Gmail: list, read, send and trash messages, show the profile
//! - Calendar: calendars, events and the current time

pub mod calendar;
pub mod gmail;
pub mod google;

pub use calendar::register_calendar_tools;
pub use gmail::register_gmail_tools;
pub use google::GoogleApi;
