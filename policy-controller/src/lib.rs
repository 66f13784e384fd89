#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod admission;
mod args;
pub mod events;

pub use self::admission::Admission;
pub use self::args::{Args, ControllerConfig};
