pub(crate) mod models;
pub(crate) mod schema;
