pub mod terminal;
pub mod utils;

pub use terminal::TerminalGateway;
pub use utils::{
    extract_initial_mention, extract_thread_references, format_response, replace_all_mentions,
};
