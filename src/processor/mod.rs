pub(crate) mod decoder;
#[allow(clippy::module_inception)]
pub(crate) mod processor;
