// Transport and host capability seams — network access and reload are injected.

pub mod http_transport;
pub mod traits;
