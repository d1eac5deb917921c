pub mod http;

pub use http::{ServerState, build_router};
