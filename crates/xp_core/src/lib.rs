pub mod aggregate;
pub mod catalog;
pub mod completion;
pub mod history;
pub mod service;
pub mod store;
pub mod token;

pub use crate::service::{TrackerService, TrackerServiceBuilder};
