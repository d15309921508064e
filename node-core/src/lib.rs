#![no_std]

pub mod boot;
pub mod clock;
pub mod command;
pub mod config;
pub mod debounce;
pub mod error;
pub mod fabric;
pub mod indicator;
pub mod motion;
pub mod retry;
pub mod session;
pub mod status;
pub mod update;
