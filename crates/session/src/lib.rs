// tandem-session: client side of a live document session.

pub mod anchors;
pub mod collab;
pub mod command;
pub mod config;
pub mod controller;
pub mod driver;
pub mod engine;
pub mod presence;
pub mod sanitize;
pub mod seed;
pub mod state;
pub mod transport;
