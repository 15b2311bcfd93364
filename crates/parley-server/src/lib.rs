pub mod client;
pub mod frames;
pub mod server;

pub use client::RequestClient;
pub use frames::{ClientFrame, ServerFrame};
pub use server::RequestServer;
