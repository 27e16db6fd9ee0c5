#[macro_use]
extern crate log;
#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate lazy_static;

pub mod coordinator;
pub mod discover;
pub mod errors;
pub mod extractor;
pub mod retry;
pub mod session;
pub mod source;
pub mod store;
pub mod types;
pub mod utils;
