pub mod backend;
pub mod config_parser;
pub mod endpoints;
pub mod error;
pub mod gateway_util;
pub mod notification;
pub mod observability;
pub mod usage_limit;
