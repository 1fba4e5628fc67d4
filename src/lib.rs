pub mod catalog;
pub mod config;
pub mod crawl;
pub mod db;
pub mod error;
pub mod feed;
pub mod fetch;
pub mod model;
pub mod normalize;
pub mod parser;
pub mod pipeline;
