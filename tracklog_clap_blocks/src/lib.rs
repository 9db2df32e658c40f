//! Building blocks for [`clap`]-driven configs of the operation processors.
//!
//! They can be flattened into any CLI and read every option from a `TRACKLOG_*` environment
//! variable as well.

pub mod processor;
