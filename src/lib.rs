//! Censorship measurement probe core.
//!
//! A measurement runs one target through an instrumented network stack
//! (`netx`), records every network event into a `trace::Saver`, and converts
//! the event log into OONI archival entries (`archival`). `urlgetter` wires the
//! pieces together for single targets and for batches.

pub mod archival;
pub mod context;
pub mod endpoint;
pub mod errors;
pub mod geolocate;
pub mod logging;
pub mod netx;
pub mod revisit;
pub mod session;
pub mod trace;
pub mod urlgetter;

#[cfg(test)]
mod testutil;
