pub mod assets;
pub mod listeners;
pub mod response;
