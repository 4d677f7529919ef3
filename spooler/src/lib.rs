//! Streaming spooler: claims master work items from the shared store and
//! spools their detail rows into framed, pipe-delimited output files.

pub mod cycle;
pub mod projection;
pub mod sink;
pub mod stats;
pub mod transaction;
pub mod worker;

pub use self::{
    cycle::{Outcome, Processor},
    worker::Worker,
};
