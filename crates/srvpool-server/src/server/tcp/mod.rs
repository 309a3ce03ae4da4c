mod handler;
mod listener;

pub use handler::*;
pub use listener::*;
