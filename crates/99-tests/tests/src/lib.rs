//! Cross-node scenarios for the segfab provider.
//!
//! Every test runs two or more simulated nodes on one loopback switch. The
//! handshake needs both sides running at once, so the connector runs on a
//! helper thread; the data-path checks then drive both endpoints from the
//! test thread unless they exercise concurrency on purpose.

pub mod harness;

#[cfg(test)]
mod connection;

#[cfg(test)]
mod messaging;

#[cfg(test)]
mod rma;
