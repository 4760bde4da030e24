mod http;
mod local;

pub use http::HttpTransport;
pub use local::LocalTransport;
