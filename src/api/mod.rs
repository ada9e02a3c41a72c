// Host-facing entry points: process-wide coordinator slot and logging set-up.

pub mod logging;
pub mod updates_api;
