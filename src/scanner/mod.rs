pub(crate) mod errors;
pub(crate) mod reorg;
#[allow(clippy::module_inception)]
pub(crate) mod scanner;
pub(crate) mod step;
