// tandem-common: wire contracts shared by the gateway and session crates

pub mod protocol;
pub mod types;
