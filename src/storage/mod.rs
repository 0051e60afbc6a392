pub mod migrations;
pub mod queries;
pub mod retention;
pub mod sqlite;
pub mod writer;
