pub mod albums;
pub mod images;
pub mod system;
