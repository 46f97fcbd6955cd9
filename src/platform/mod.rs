pub mod command;
pub mod iis;
