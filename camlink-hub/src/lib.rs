//! # camlink-hub: Frame Hub
//!
//! Runs on the viewing machine. Accepts one camera node at a time (TCP) or
//! exchanges datagrams with a fixed node address (UDP), keeps the freshest
//! complete frame, and lets an operator arm and disarm the node.
//!
//! Presentation is deliberately thin: a line console on stdin and an
//! optional snapshot file rewritten whenever a new frame lands.

pub mod config;
pub mod console;
pub mod service;
pub mod snapshot;
