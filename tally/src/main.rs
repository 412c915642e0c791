//! The Tally binary.
//!
//! Tally records accesses to downloadable resources and aggregates them into unique visitor
//! counts, exact page views, realtime minute series and daily rankings. State lives in Redis, so
//! several instances can share the same aggregates.
//!
//! Run `tally --help` for the available commands.

mod cli;
mod cliapp;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            tally_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
