pub mod job;
pub mod recipe;
pub mod request;
