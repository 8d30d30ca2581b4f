#![allow(clippy::len_zero, clippy::should_implement_trait, clippy::manual_map, clippy::from_over_into)]

#[macro_use] extern crate snafu;
#[macro_use] extern crate log;

#[macro_use]
pub mod error;
pub mod backend;
pub mod content;
pub mod enc;
pub mod file;
pub mod object;
pub mod parser;
pub mod primitive;
pub mod writer;
pub mod xref;

pub use crate::error::PdfError;
