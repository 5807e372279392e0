//! Multicast NAND reflashing.
//!
//! A sender erasure-codes a flash image and repeats it over UDP multicast;
//! any number of receivers reconstruct it onto their local NAND, tolerating
//! packet loss, bad blocks, and write failures. See [session::Session] for
//! the receive engine and [sender::ImageSender] for the transmit side.

pub mod crypto;
pub mod error;
pub mod fec;
pub mod nand;
pub mod partition;
pub mod placement;
pub mod sender;
pub mod session;
pub mod transport;
pub mod wire;
