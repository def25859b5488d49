mod args;

pub use args::{Args, Command, OutputFormat, ResolveArgs};
