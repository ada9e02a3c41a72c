// Update engine — cache, manifest resolution, bundle download and the cycle coordinator.

pub mod cache;
pub mod coordinator;
pub mod downloader;
pub mod events;
pub mod fetcher;
pub mod manifest;
pub mod stats;
