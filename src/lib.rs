//! Recipe extraction service
//!
//! Accepts recipe extraction requests for web pages, photos and videos, runs each
//! as a background job under concurrency, quota and deadline limits, and drives
//! Cloudflare Workers AI to turn the source into a structured recipe.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
