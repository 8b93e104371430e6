pub(crate) mod db;
pub(crate) mod errors;
pub(crate) mod models;
pub(crate) mod types;
