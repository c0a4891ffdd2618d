pub mod aggregator;
pub mod capture;
pub mod config;
pub mod detector;
pub mod enroll;
pub mod events;
pub mod frame;
pub mod gallery;
pub mod notifier;
pub mod presence;
pub mod recognition;
pub mod slot;
pub mod snapshot;
pub mod source;
pub mod supervisor;

pub use aggregator::OutletAggregator;
pub use config::AppConfig;
pub use events::{Event, EventStore, EventType};
pub use gallery::{GalleryIndex, GalleryStore};
pub use presence::PresenceEngine;
pub use slot::FrameSlot;
