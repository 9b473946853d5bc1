pub mod errors;
pub mod ids;
pub mod messages;
