pub mod campaign;
pub mod config;
pub mod db;
pub mod model;
pub mod queue;
pub mod realtime;
pub mod template;
pub mod whatsapp;
pub mod worker;
