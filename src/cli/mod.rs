pub mod commands;
pub mod ui;
pub mod util;

pub use ui::Output;
pub use util::{is_initialized, qualweave_dir, require_initialized, CommandContext};
