pub mod http;
pub mod ports;

pub use http::HttpProbe;
