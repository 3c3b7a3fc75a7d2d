#[macro_use]
pub mod socket_guard;
