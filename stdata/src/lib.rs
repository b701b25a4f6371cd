// src/lib.rs
pub mod data {
    pub mod handle;
    pub mod meta;
}

pub mod config;
pub mod error;
pub mod pipeline;
pub mod progress;
