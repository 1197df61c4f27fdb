//! Network collaborators used before the SIP socket is opened

pub mod dns;
pub mod public_ip;

pub use dns::{RegistrarResolver, SrvRegistrarResolver, StaticRegistrarResolver};
pub use public_ip::{HttpPublicIpResolver, PublicIpResolver, StaticPublicIp};
