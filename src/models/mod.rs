pub mod position;
pub mod route;
pub mod trip;
