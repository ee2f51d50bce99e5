pub mod policy;
pub mod record;
