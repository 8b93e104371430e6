pub(crate) mod client;
pub(crate) mod errors;
pub(crate) mod types;
