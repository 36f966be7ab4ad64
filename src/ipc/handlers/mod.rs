pub mod accounts;
pub mod administrativo;
pub mod core;
pub mod dashboard;
pub mod operations;
pub mod pedagogico;
pub mod secretaria;
