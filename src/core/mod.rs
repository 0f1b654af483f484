// Core modules implementing the embedded database, record layout, and error modeling.
pub mod db;
pub mod error;
pub mod format;
pub mod record;
