pub mod config;
pub mod diagnostic_logging;
pub mod dkim;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod smtp_server;
pub mod upstream;
pub mod vhost;

#[cfg(test)]
mod sink;
#[cfg(test)]
mod end_to_end;
