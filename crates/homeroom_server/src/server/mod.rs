#![forbid(unsafe_code)]

pub mod action;
pub mod auth;
pub mod connection;
pub mod health;
pub mod moderation;
pub mod rest;
pub mod room_hub;
pub mod state;
pub mod store;

#[cfg(test)]
mod connection_tests;
