pub mod header;
pub mod results;
