pub mod bootstrap;
pub mod db;
pub mod indexes;
pub mod verify;
