//! # camlink-node: Camera Node
//!
//! Captures JPEG frames and streams them to the hub while the hub has the
//! node armed with `START`. Connects over TCP (node dials the hub) or UDP
//! (fixed peer, chunked frames), reconnecting with backoff whenever the link
//! drops.
//!
//! Without camera hardware the node replays a directory of JPEG files
//! through [`source::DirectorySource`].

pub mod config;
pub mod service;
pub mod source;
