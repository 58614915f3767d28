pub mod classify;
pub mod client;
pub mod config;
pub mod decoder;
pub mod delay;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod logs;
pub mod markup;
pub mod ports;
pub mod process;
pub mod resolve;
pub mod retry;
pub mod stream;

#[cfg(any(test, feature = "testing"))]
pub mod test_support;

pub use classify::*;
pub use client::*;
pub use config::*;
pub use decoder::*;
pub use delay::*;
pub use error::*;
pub use health::*;
pub use lifecycle::*;
pub use logs::*;
pub use markup::*;
pub use ports::*;
pub use process::*;
pub use resolve::*;
pub use retry::*;
pub use stream::*;

pub use wingman_wire::{StreamEvent, ToolExecution};
