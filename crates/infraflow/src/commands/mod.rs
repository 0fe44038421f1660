pub mod apply;
pub mod destroy;
pub mod quota;
pub mod status;
pub mod validate;
