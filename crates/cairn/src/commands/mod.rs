pub mod backup;
pub mod list;
pub mod receive;
pub mod restore;
pub mod send;
