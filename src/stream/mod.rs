pub mod echo;
pub mod sender;
pub mod socket;
