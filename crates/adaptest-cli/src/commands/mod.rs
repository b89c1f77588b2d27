pub mod init;
pub mod items;
pub mod score;
pub mod simulate;
pub mod validate;
